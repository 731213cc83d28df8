//! Raw COPY: CopyData payloads in either direction, untouched.

use crate::connector::{QueryCursor, SessionGuard};
use crate::error::{Error, Result};

use super::{CopyDirection, cancel_in, drain_out, finish_in, flush_if_full};

/// A binary COPY stream handed through as opaque bytes, for piping between
/// servers or to files.
pub struct RawCopy {
    session: SessionGuard,
    cursor: QueryCursor,
    direction: CopyDirection,
    end_of_data: bool,
    finished: bool,
}

impl RawCopy {
    pub(crate) fn new(mut session: SessionGuard, cursor: QueryCursor, direction: CopyDirection) -> Self {
        session.copy_buffer().clear();
        Self {
            session,
            cursor,
            direction,
            end_of_data: false,
            finished: false,
        }
    }

    pub fn direction(&self) -> CopyDirection {
        self.direction
    }

    fn expect(&self, direction: CopyDirection) -> Result<()> {
        if self.direction == direction {
            Ok(())
        } else {
            Err(Error::InvalidUsage(format!(
                "raw COPY is {:?}, not {:?}",
                self.direction, direction
            )))
        }
    }

    /// Queue bytes for the server (COPY IN only).
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.expect(CopyDirection::In)?;
        self.session.copy_buffer().extend_from_slice(data);
        flush_if_full(&mut self.session).await
    }

    /// Next CopyData payload (COPY OUT only), or `None` at the end.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
        self.expect(CopyDirection::Out)?;
        if self.end_of_data {
            return Ok(None);
        }
        let result = self.session.next_copy_data(&mut self.cursor).await;
        match self.session.settle(result).await? {
            Some(range) => Ok(Some(self.session.payload(range).to_vec())),
            None => {
                self.end_of_data = true;
                Ok(None)
            }
        }
    }

    /// Complete the COPY and return the row count.
    ///
    /// For COPY IN this sends CopyDone; for COPY OUT unread data is discarded.
    pub async fn finish(mut self) -> Result<u64> {
        self.finished = true;
        match self.direction {
            CopyDirection::In => finish_in(&mut self.session, &mut self.cursor).await,
            CopyDirection::Out if self.end_of_data => Ok(self.cursor.rows_affected()),
            CopyDirection::Out => drain_out(&mut self.session, &mut self.cursor).await,
        }
    }

    /// Abort a COPY IN, or discard the rest of a COPY OUT.
    pub async fn cancel(mut self) -> Result<()> {
        self.finished = true;
        match self.direction {
            CopyDirection::In => cancel_in(&mut self.session, &mut self.cursor).await,
            CopyDirection::Out if self.end_of_data => Ok(()),
            CopyDirection::Out => drain_out(&mut self.session, &mut self.cursor)
                .await
                .map(|_| ()),
        }
    }
}

impl Drop for RawCopy {
    fn drop(&mut self) {
        if !self.finished && self.direction == CopyDirection::In {
            tracing::debug!("raw COPY IN dropped unfinished");
            self.session.copy_buffer().clear();
        }
    }
}
