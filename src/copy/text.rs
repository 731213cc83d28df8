//! Text COPY: data passes through verbatim, exported lines are decoded as UTF-8.

use memchr::memchr;

use crate::connector::{QueryCursor, SessionGuard};
use crate::error::Result;
use crate::types::scalar::decode_utf8;

use super::{cancel_in, drain_out, finish_in, flush_if_full};

/// Sends text COPY data. Rows and delimiters are the caller's business.
pub struct TextImporter {
    session: SessionGuard,
    cursor: QueryCursor,
    finished: bool,
}

impl TextImporter {
    pub(crate) fn new(mut session: SessionGuard, cursor: QueryCursor) -> Self {
        session.copy_buffer().clear();
        Self {
            session,
            cursor,
            finished: false,
        }
    }

    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        self.session
            .copy_buffer()
            .extend_from_slice(data.as_ref());
        flush_if_full(&mut self.session).await
    }

    /// Write `line` followed by a newline.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let buf = self.session.copy_buffer();
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        flush_if_full(&mut self.session).await
    }

    /// Send CopyDone. Returns the number of imported rows.
    pub async fn finish(mut self) -> Result<u64> {
        self.finished = true;
        finish_in(&mut self.session, &mut self.cursor).await
    }

    pub async fn cancel(mut self) -> Result<()> {
        self.finished = true;
        cancel_in(&mut self.session, &mut self.cursor).await
    }
}

impl Drop for TextImporter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("text import dropped unfinished");
            self.session.copy_buffer().clear();
        }
    }
}

/// Reads text COPY output line by line.
pub struct TextExporter {
    session: SessionGuard,
    cursor: QueryCursor,
    pending: Vec<u8>,
    end_of_data: bool,
}

impl TextExporter {
    pub(crate) fn new(session: SessionGuard, cursor: QueryCursor) -> Self {
        Self {
            session,
            cursor,
            pending: Vec::new(),
            end_of_data: false,
        }
    }

    /// Next line without its terminating newline, or `None` at the end.
    ///
    /// Lines may span CopyData messages. Trailing data without a newline is
    /// returned as a last line.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(end) = memchr(b'\n', &self.pending) {
                let line = decode_utf8(&self.pending[..end])?.to_owned();
                self.pending.drain(..=end);
                return Ok(Some(line));
            }
            if self.end_of_data {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let line = decode_utf8(&self.pending)?.to_owned();
                self.pending.clear();
                return Ok(Some(line));
            }
            let result = self.session.next_copy_data(&mut self.cursor).await;
            match self.session.settle(result).await? {
                Some(range) => self.pending.extend_from_slice(self.session.payload(range)),
                None => self.end_of_data = true,
            }
        }
    }

    /// Discard the rest of the data. Returns the number of exported rows.
    pub async fn finish(mut self) -> Result<u64> {
        if self.end_of_data {
            return Ok(self.cursor.rows_affected());
        }
        drain_out(&mut self.session, &mut self.cursor).await
    }
}
