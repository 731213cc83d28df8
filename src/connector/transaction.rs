//! Transactions and savepoints.

use std::ops::Deref;

use crate::error::Result;

use super::Connector;

/// Transaction isolation level for [`Connector::begin_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// An open transaction on a connector.
///
/// Statements run through the transaction (it dereferences to the
/// [`Connector`]) or directly on the connector take part in it. Dropping it
/// without [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback) schedules a ROLLBACK that runs before
/// the connector's next operation.
pub struct Transaction<'c> {
    connector: &'c Connector,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(connector: &'c Connector) -> Self {
        Self {
            connector,
            finished: false,
        }
    }

    pub async fn commit(mut self) -> Result<()> {
        let result = self.connector.execute("COMMIT", &[]).await;
        self.finish(result)
    }

    pub async fn rollback(mut self) -> Result<()> {
        let result = self.connector.execute("ROLLBACK", &[]).await;
        self.finish(result)
    }

    /// `SAVEPOINT name`
    pub async fn savepoint(&self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {}", quote_identifier(name));
        self.connector.execute(&sql, &[]).await.map(|_| ())
    }

    /// `ROLLBACK TO SAVEPOINT name`
    pub async fn rollback_to(&self, name: &str) -> Result<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name));
        self.connector.execute(&sql, &[]).await.map(|_| ())
    }

    /// `RELEASE SAVEPOINT name`
    pub async fn release(&self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", quote_identifier(name));
        self.connector.execute(&sql, &[]).await.map(|_| ())
    }

    fn finish(&mut self, result: Result<u64>) -> Result<()> {
        // A busy connector never saw the statement, so the transaction is still open.
        if !matches!(&result, Err(err) if err.is_busy()) {
            self.finished = true;
        }
        result.map(|_| ())
    }
}

impl Deref for Transaction<'_> {
    type Target = Connector;

    fn deref(&self) -> &Connector {
        self.connector
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("transaction dropped without commit or rollback");
            self.connector.schedule_rollback();
        }
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("s1"), "\"s1\"");
        assert_eq!(quote_identifier("my \"point\""), "\"my \"\"point\"\"\"");
    }

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }
}
