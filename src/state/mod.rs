//! Sans-I/O state machines for the PostgreSQL protocol.
//!
//! These state machines handle the protocol logic without performing any I/O.
//! The connector feeds them backend messages and performs the I/O they ask for.

pub mod action;
pub mod connection;
pub mod connector;
pub mod query;

pub use action::Action;
pub use connection::{StartupPhase, StartupStateMachine};
pub use connector::{ConnectionState, ConnectorState};
pub use query::{QueryStateMachine, Step};
