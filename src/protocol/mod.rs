//! Protocol version 3 message framing.
//!
//! `frontend` writes client messages into a byte buffer, `backend` parses
//! server messages out of one, and `codec` holds the shared big-endian
//! primitives. Nothing here touches a socket.

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use backend::RawMessage;
pub use types::{FormatCode, Oid, TransactionStatus};
