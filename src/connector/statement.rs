use std::sync::Arc;

use crate::protocol::types::Oid;
use crate::row::Column;

/// A statement parsed by the server, with its parameter and result types.
///
/// Named statements come from [`Connector::prepare`] and live until
/// [`Connector::close_statement`] or the end of the session.
///
/// [`Connector::prepare`]: crate::Connector::prepare
/// [`Connector::close_statement`]: crate::Connector::close_statement
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) name: String,
    pub(crate) sql: String,
    pub(crate) param_oids: Vec<Oid>,
    pub(crate) columns: Arc<[Column]>,
    /// Backend that parsed it; statements do not travel between sessions
    pub(crate) process_id: u32,
}

impl Statement {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter types as resolved by the server.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// Result columns. Formats are not chosen until execution.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}
