//! A PostgreSQL wire-protocol connector.
//!
//! # Features
//!
//! - **Sans-I/O state machines**: startup and query flows are driven by
//!   message-in, action-out machines, independent of the socket
//! - **Type codec registry**: built-in scalars, geometric types, arrays, and
//!   enums registered per connector or process-wide
//! - **Keyed pooling**: connectors shared per normalized option set, with
//!   gradual idle pruning
//! - **COPY streaming**: binary, text and raw COPY in both directions
//!
//! # Example
//!
//! ```no_run
//! use pgconnector::{Opts, Value};
//!
//! #[tokio::main]
//! async fn main() -> pgconnector::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         database: Some("mydb".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let conn = pgconnector::connect(opts).await?;
//!
//!     let rows = conn
//!         .query_all("SELECT id, name FROM users WHERE id > $1", &[Value::from(10_i32)])
//!         .await?;
//!     for row in rows {
//!         let name: String = row.get(1)?;
//!         println!("{}", name);
//!     }
//!     Ok(())
//! }
//! ```

pub mod buffer_pool;
pub mod buffer_set;
pub mod connector;
pub mod copy;
pub mod error;
pub mod events;
pub mod opts;
pub mod pool;
pub mod protocol;
pub mod row;
pub mod state;
pub mod types;

pub use connector::{
    BackendParams, Connector, IsolationLevel, RowStream, Statement, Transaction,
};
pub use copy::{BinaryExporter, BinaryImporter, CopyDirection, RawCopy, TextExporter, TextImporter};
pub use error::{Error, ErrorFields, Result};
pub use events::{Notice, Notification, StateChange};
pub use opts::{Opts, SslMode};
pub use pool::{Connection, Pool, PoolKey, PoolStats, PooledConnector, clear_all_pools, connect};
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use row::{Column, FromRow, Row};
pub use state::{ConnectionState, ConnectorState};
pub use types::{
    FromValue, PgEnum, TypeRegistry, Value, clear_global_types, register_enum_globally,
    register_pg_enum_globally, unregister_enum_globally,
};
