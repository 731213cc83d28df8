//! Binary COPY format.
//!
//! ```text
//! header:  "PGCOPY\n\xff\r\n\0"  flags: i32  extension length: i32  extension
//! row:     field count: i16  { field length: i32 (-1 = NULL)  bytes }*
//! trailer: -1: i16
//! ```

use crate::connector::{QueryCursor, SessionGuard};
use crate::error::{Error, Result};
use crate::types::{FromValue, Value, read_field};

use super::{cancel_in, drain_out, finish_in, flush_if_full};

const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// Signature, flags and extension length.
const HEADER_LEN: usize = 19;

/// Flags bit 16: every row carries an OID field.
const FLAG_WITH_OIDS: i32 = 1 << 16;

fn write_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(SIGNATURE);
    buf.extend_from_slice(&0_i32.to_be_bytes());
    buf.extend_from_slice(&0_i32.to_be_bytes());
}

/// Validate the fixed header and return the extension length that follows it.
fn parse_header(header: &[u8; HEADER_LEN]) -> Result<usize> {
    if &header[..11] != SIGNATURE {
        return Err(Error::Protocol("invalid binary COPY signature".into()));
    }
    let flags = i32::from_be_bytes([header[11], header[12], header[13], header[14]]);
    if flags & FLAG_WITH_OIDS != 0 {
        return Err(Error::Unsupported("binary COPY with OIDs".into()));
    }
    let extension = i32::from_be_bytes([header[15], header[16], header[17], header[18]]);
    usize::try_from(extension).map_err(|_| {
        Error::Protocol(format!("negative binary COPY extension length {}", extension))
    })
}

/// Writes rows in binary COPY format through the type registry.
///
/// ```no_run
/// # async fn demo(conn: &pgconnector::Connector) -> pgconnector::Result<()> {
/// let mut import = conn
///     .begin_binary_import("COPY points (id, label) FROM STDIN (FORMAT BINARY)")
///     .await?;
/// for id in 0..3 {
///     import.start_row().await?;
///     import.write(id)?;
///     import.write_typed(format!("p{}", id), "text")?;
/// }
/// let imported = import.finish().await?;
/// # Ok(())
/// # }
/// ```
pub struct BinaryImporter {
    session: SessionGuard,
    cursor: QueryCursor,
    num_columns: usize,
    /// Fields written in the current row; None before the first row
    column: Option<usize>,
    rows: u64,
    finished: bool,
}

impl BinaryImporter {
    pub(crate) fn new(mut session: SessionGuard, cursor: QueryCursor, num_columns: usize) -> Self {
        let buf = session.copy_buffer();
        buf.clear();
        write_header(buf);
        Self {
            session,
            cursor,
            num_columns,
            column: None,
            rows: 0,
            finished: false,
        }
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Rows started so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn check_row_complete(&self) -> Result<()> {
        match self.column {
            Some(written) if written != self.num_columns => Err(Error::InvalidUsage(format!(
                "row {} has {} of {} columns",
                self.rows, written, self.num_columns
            ))),
            _ => Ok(()),
        }
    }

    pub async fn start_row(&mut self) -> Result<()> {
        self.check_row_complete()?;
        flush_if_full(&mut self.session).await?;
        let count = self.num_columns as i16;
        self.session
            .copy_buffer()
            .extend_from_slice(&count.to_be_bytes());
        self.column = Some(0);
        self.rows += 1;
        Ok(())
    }

    fn write_value(&mut self, value: &Value, type_name: Option<&str>) -> Result<()> {
        let written = match self.column {
            None => {
                return Err(Error::InvalidUsage(
                    "start_row must be called before writing fields".into(),
                ));
            }
            Some(written) if written >= self.num_columns => {
                return Err(Error::InvalidUsage(format!(
                    "row {} already has all {} columns",
                    self.rows, self.num_columns
                )));
            }
            Some(written) => written,
        };
        self.session.stage_copy_value(value, type_name)?;
        self.column = Some(written + 1);
        Ok(())
    }

    /// Write the next field with the handler matching the value's own type.
    pub fn write(&mut self, value: impl Into<Value>) -> Result<()> {
        self.write_value(&value.into(), None)
    }

    /// Write the next field as the named server type, e.g. `"int8"` or `"mood[]"`.
    pub fn write_typed(&mut self, value: impl Into<Value>, type_name: &str) -> Result<()> {
        self.write_value(&value.into(), Some(type_name))
    }

    pub fn write_null(&mut self) -> Result<()> {
        self.write_value(&Value::Null, None)
    }

    /// Start a row and write every field of it.
    pub async fn write_row<I, V>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.start_row().await?;
        for value in values {
            self.write_value(&value.into(), None)?;
        }
        self.check_row_complete()
    }

    /// Send the trailer and CopyDone. Returns the number of imported rows.
    pub async fn finish(mut self) -> Result<u64> {
        self.check_row_complete()?;
        self.session
            .copy_buffer()
            .extend_from_slice(&(-1_i16).to_be_bytes());
        self.finished = true;
        finish_in(&mut self.session, &mut self.cursor).await
    }

    /// Abort the COPY. The server keeps none of the rows.
    pub async fn cancel(mut self) -> Result<()> {
        self.finished = true;
        cancel_in(&mut self.session, &mut self.cursor).await
    }
}

impl Drop for BinaryImporter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(rows = self.rows, "binary import dropped unfinished");
            self.session.copy_buffer().clear();
        }
    }
}

/// Reads rows in binary COPY format.
///
/// Fields may span CopyData messages; the exporter buffers across them.
pub struct BinaryExporter {
    session: SessionGuard,
    cursor: QueryCursor,
    num_columns: usize,
    data: Vec<u8>,
    pos: usize,
    header_read: bool,
    /// (fields in the current row, fields consumed)
    row: Option<(usize, usize)>,
    end_of_data: bool,
}

impl BinaryExporter {
    pub(crate) fn new(session: SessionGuard, cursor: QueryCursor, num_columns: usize) -> Self {
        Self {
            session,
            cursor,
            num_columns,
            data: Vec::new(),
            pos: 0,
            header_read: false,
            row: None,
            end_of_data: false,
        }
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Make at least `n` unread bytes available.
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.data.len() - self.pos < n {
            if self.pos > 0 {
                self.data.drain(..self.pos);
                self.pos = 0;
            }
            let result = self.session.next_copy_data(&mut self.cursor).await;
            match self.session.settle(result).await? {
                Some(range) => self.data.extend_from_slice(self.session.payload(range)),
                None => {
                    return Err(Error::Protocol(
                        "binary COPY data ended before the trailer".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> &[u8] {
        let start = self.pos;
        self.pos += n;
        &self.data[start..start + n]
    }

    async fn read_i16(&mut self) -> Result<i16> {
        self.fill(2).await?;
        let bytes = self.take(2);
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    async fn read_i32(&mut self) -> Result<i32> {
        self.fill(4).await?;
        let bytes = self.take(4);
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn read_header(&mut self) -> Result<()> {
        self.fill(HEADER_LEN).await?;
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(self.take(HEADER_LEN));
        let extension = parse_header(&header)?;
        self.fill(extension).await?;
        self.take(extension);
        self.header_read = true;
        Ok(())
    }

    /// Advance to the next row, skipping unread fields of the current one.
    ///
    /// Returns the row's field count, or `None` at the end of the data.
    pub async fn start_row(&mut self) -> Result<Option<usize>> {
        if self.end_of_data {
            return Ok(None);
        }
        if !self.header_read {
            self.read_header().await?;
        }
        if let Some((fields, consumed)) = self.row {
            for _ in consumed..fields {
                self.skip().await?;
            }
        }

        let count = self.read_i16().await?;
        if count == -1 {
            self.end_of_data = true;
            self.row = None;
            return Ok(None);
        }
        let count = usize::try_from(count)
            .map_err(|_| Error::Protocol(format!("invalid binary COPY field count {}", count)))?;
        if count != self.num_columns {
            return Err(Error::Protocol(format!(
                "binary COPY row has {} fields, the COPY declared {}",
                count, self.num_columns
            )));
        }
        self.row = Some((count, 0));
        Ok(Some(count))
    }

    fn next_field(&mut self) -> Result<()> {
        match &mut self.row {
            Some((fields, consumed)) if *consumed < *fields => {
                *consumed += 1;
                Ok(())
            }
            Some(_) => Err(Error::InvalidUsage(
                "every field of the row has been read".into(),
            )),
            None => Err(Error::InvalidUsage(
                "start_row must be called before reading fields".into(),
            )),
        }
    }

    async fn field_len(&mut self) -> Result<Option<usize>> {
        let len = self.read_i32().await?;
        if len == -1 {
            return Ok(None);
        }
        usize::try_from(len)
            .map(Some)
            .map_err(|_| Error::Protocol(format!("invalid binary COPY field length {}", len)))
    }

    /// Read the next field as the named server type.
    pub async fn read(&mut self, type_name: &str) -> Result<Value> {
        let handler = self
            .session
            .registry
            .get_by_name(type_name)
            .cloned()
            .ok_or_else(|| Error::InvalidUsage(format!("unknown type {:?}", type_name)))?;
        self.next_field()?;
        let Some(len) = self.field_len().await? else {
            return Ok(Value::Null);
        };
        self.fill(len).await?;
        read_field(&handler, self.take(len))
    }

    pub async fn read_as<T: FromValue>(&mut self, type_name: &str) -> Result<T> {
        T::from_value(&self.read(type_name).await?)
    }

    /// Read a whole row, one type name per column.
    pub async fn read_row(&mut self, type_names: &[&str]) -> Result<Option<Vec<Value>>> {
        if self.start_row().await?.is_none() {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(type_names.len());
        for type_name in type_names {
            values.push(self.read(type_name).await?);
        }
        Ok(Some(values))
    }

    /// Skip the next field.
    pub async fn skip(&mut self) -> Result<()> {
        self.next_field()?;
        if let Some(len) = self.field_len().await? {
            self.fill(len).await?;
            self.take(len);
        }
        Ok(())
    }

    /// Whether the next field is NULL, without consuming it.
    pub async fn is_null(&mut self) -> Result<bool> {
        match self.row {
            Some((fields, consumed)) if consumed < fields => {}
            _ => return Err(Error::InvalidUsage("no field left to inspect".into())),
        }
        self.fill(4).await?;
        let bytes = &self.data[self.pos..self.pos + 4];
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == -1)
    }

    /// Discard the rest of the data. Returns the number of exported rows.
    pub async fn finish(mut self) -> Result<u64> {
        drain_out(&mut self.session, &mut self.cursor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let header: [u8; HEADER_LEN] = buf.try_into().unwrap();
        assert_eq!(parse_header(&header).unwrap(), 0);
    }

    #[test]
    fn test_header_rejects() {
        let mut buf = Vec::new();
        write_header(&mut buf);
        let mut header: [u8; HEADER_LEN] = buf.try_into().unwrap();

        let mut bad_signature = header;
        bad_signature[0] = b'X';
        assert!(matches!(parse_header(&bad_signature), Err(Error::Protocol(_))));

        let mut with_oids = header;
        with_oids[11..15].copy_from_slice(&FLAG_WITH_OIDS.to_be_bytes());
        assert!(matches!(parse_header(&with_oids), Err(Error::Unsupported(_))));

        header[15..19].copy_from_slice(&8_i32.to_be_bytes());
        assert_eq!(parse_header(&header).unwrap(), 8);
    }
}
