//! Query-related backend messages.

use std::mem::size_of;

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{expect_end, read_bytes, read_cstr, read_i16, read_i32};
use crate::protocol::types::{FormatCode, Oid};

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub table_oid: U32BE,
    /// Column attribute number (0 if not a table column)
    pub column_id: I16BE,
    /// Data type OID
    pub type_oid: U32BE,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: I16BE,
    /// Type modifier (type-specific)
    pub type_modifier: I32BE,
    /// Format code (0=text, 1=binary)
    pub format: U16BE,
}

/// Field description within a RowDescription.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescription<'a> {
    /// Field name
    pub name: &'a str,
    /// Fixed-size metadata
    pub tail: &'a FieldDescriptionTail,
}

impl FieldDescription<'_> {
    pub fn table_oid(&self) -> Oid {
        self.tail.table_oid.get()
    }

    pub fn column_id(&self) -> i16 {
        self.tail.column_id.get()
    }

    pub fn type_oid(&self) -> Oid {
        self.tail.type_oid.get()
    }

    pub fn type_size(&self) -> i16 {
        self.tail.type_size.get()
    }

    pub fn type_modifier(&self) -> i32 {
        self.tail.type_modifier.get()
    }

    /// Format code. A code other than text or binary is a framing error.
    pub fn format(&self) -> Result<FormatCode> {
        let raw = self.tail.format.get();
        FormatCode::from_wire(raw)
            .ok_or_else(|| Error::Protocol(format!("RowDescription: bad format code {}", raw)))
    }
}

/// RowDescription message - describes the columns in a result set.
#[derive(Debug)]
pub struct RowDescription<'a> {
    fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_fields, mut data) = read_i16(payload)?;
        if num_fields < 0 {
            return Err(Error::Protocol(format!(
                "RowDescription: negative field count {}",
                num_fields
            )));
        }

        const TAIL_SIZE: usize = size_of::<FieldDescriptionTail>();

        let mut fields = Vec::with_capacity(num_fields as usize);
        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            let (tail, rest) = read_bytes(rest, TAIL_SIZE)?;
            let tail = FieldDescriptionTail::ref_from_bytes(tail)
                .map_err(|e| Error::Protocol(format!("FieldDescription tail: {e:?}")))?;
            fields.push(FieldDescription { name, tail });
            data = rest;
        }
        expect_end(data, "RowDescription")?;

        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldDescription<'a>] {
        &self.fields
    }
}

/// DataRow message - contains a single row of data.
///
/// Parsing walks every declared column length once, so a row whose lengths
/// do not add up to the payload size is rejected before any value is decoded.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: u16,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, columns_data) = read_i16(payload)?;
        if num_columns < 0 {
            return Err(Error::Protocol(format!(
                "DataRow: negative column count {}",
                num_columns
            )));
        }

        let mut data = columns_data;
        for _ in 0..num_columns {
            let (len, rest) = read_i32(data)?;
            data = match len {
                -1 => rest,
                len if len >= 0 => read_bytes(rest, len as usize)?.1,
                _ => {
                    return Err(Error::Protocol(format!(
                        "DataRow: invalid column length {}",
                        len
                    )));
                }
            };
        }
        expect_end(data, "DataRow")?;

        Ok(Self {
            num_columns: num_columns as u16,
            columns_data,
        })
    }

    pub fn len(&self) -> usize {
        self.num_columns as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Iterate over column values; `None` represents NULL.
    pub fn iter(&self) -> DataRowIter<'a> {
        DataRowIter {
            remaining: self.columns_data,
        }
    }
}

/// Iterator over column values in a validated DataRow.
#[derive(Debug, Clone)]
pub struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let (len, rest) = self.remaining.split_first_chunk::<4>()?;
        let len = i32::from_be_bytes(*len);
        if len < 0 {
            self.remaining = rest;
            return Some(None);
        }
        let (value, rest) = rest.split_at_checked(len as usize)?;
        self.remaining = rest;
        Some(Some(value))
    }
}

/// CommandComplete message - indicates successful completion of a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "COPY 10")
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, rest) = read_cstr(payload)?;
        expect_end(rest, "CommandComplete")?;
        Ok(Self { tag })
    }

    /// Number of rows affected, taken from the last word of the tag.
    ///
    /// Returns `None` for tags without a count (e.g. "BEGIN", "CREATE TABLE").
    pub fn rows_affected(&self) -> Option<u64> {
        let mut parts = self.tag.split_whitespace();
        let command = parts.next()?;
        match command {
            "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "MOVE" | "FETCH" | "COPY" => {
                parts.last()?.parse().ok()
            }
            _ => None,
        }
    }
}
