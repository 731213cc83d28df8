use crate::error::Result;
use crate::row::{Column, FromRow, Row};

use super::session::{QueryCursor, SessionGuard};

/// Rows of a running query.
///
/// The stream holds the connector for as long as it lives: any other
/// operation on the same connector fails with [`Error::Busy`] until the
/// stream is finished, closed or dropped. A dropped stream leaves the rest of
/// the response on the wire; the connector discards it on next use.
///
/// [`Error::Busy`]: crate::Error::Busy
pub struct RowStream {
    session: SessionGuard,
    cursor: QueryCursor,
}

impl RowStream {
    pub(crate) fn new(session: SessionGuard, cursor: QueryCursor) -> Self {
        Self { session, cursor }
    }

    /// Next row, or `None` once every statement has completed.
    ///
    /// A server error raised mid-stream is returned here, after the rows that
    /// preceded it.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        let result = self.session.next_row(&mut self.cursor).await;
        if result.is_err() {
            self.cursor.abandon();
        }
        self.session.settle(result).await
    }

    /// Columns of the current result set. Empty before the first description arrives.
    pub fn columns(&self) -> &[Column] {
        self.cursor.columns()
    }

    /// Rows reported by the CommandComplete tags read so far.
    pub fn rows_affected(&self) -> u64 {
        self.cursor.rows_affected()
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.is_done()
    }

    /// Read everything that is left.
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Read the remaining rows as tuples.
    pub async fn collect_as<T: FromRow>(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(row) = self.next().await? {
            out.push(T::from_row(&row)?);
        }
        Ok(out)
    }

    /// Discard the remaining rows and release the connector.
    pub async fn close(mut self) -> Result<u64> {
        if self.cursor.is_done() {
            return Ok(self.cursor.rows_affected());
        }
        let result = self.session.drain(&mut self.cursor).await;
        if result.is_err() {
            self.cursor.abandon();
        }
        self.session.settle(result).await
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.cursor.columns().len())
            .field("rows_affected", &self.cursor.rows_affected())
            .field("finished", &self.cursor.is_done())
            .finish()
    }
}
