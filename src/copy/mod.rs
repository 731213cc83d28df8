//! COPY streaming on top of a claimed connector.
//!
//! Each wrapper owns the connector until it is finished, cancelled or
//! dropped. A wrapper dropped mid-COPY leaves the connector in its COPY
//! state; the next operation fails the COPY IN or drains the COPY OUT before
//! it runs.

mod binary;
mod raw;
mod text;

pub use binary::{BinaryExporter, BinaryImporter};
pub use raw::RawCopy;
pub use text::{TextExporter, TextImporter};

pub use crate::connector::CopyDirection;

use crate::connector::{QueryCursor, SessionGuard};
use crate::error::Result;

/// Staged rows are sent as one CopyData message once they reach this size.
pub(crate) const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Reason sent with CopyFail by `cancel()`.
pub(crate) const CANCEL_REASON: &str = "COPY cancelled by the client";

async fn flush_if_full(session: &mut SessionGuard) -> Result<()> {
    if session.copy_buffer().len() < FLUSH_THRESHOLD {
        return Ok(());
    }
    let result = session.flush_copy_data().await;
    session.settle(result).await
}

async fn finish_in(session: &mut SessionGuard, cursor: &mut QueryCursor) -> Result<u64> {
    let result = session.finish_copy_in(cursor).await;
    session.settle(result).await
}

async fn cancel_in(session: &mut SessionGuard, cursor: &mut QueryCursor) -> Result<()> {
    let result = session.fail_copy_in(cursor, CANCEL_REASON).await;
    session.settle(result).await
}

/// Discard whatever is left of a COPY OUT and return the exported row count.
async fn drain_out(session: &mut SessionGuard, cursor: &mut QueryCursor) -> Result<u64> {
    loop {
        let result = session.next_copy_data(cursor).await;
        if session.settle(result).await?.is_none() {
            return Ok(cursor.rows_affected());
        }
    }
}
