//! Response sequencing for simple, extended and COPY commands.
//!
//! The machine only classifies and checks the order of backend messages; the
//! session parses payloads it cares about. Async messages are filtered out
//! before they reach it.

use crate::error::{Error, Result};
use crate::protocol::backend::{ErrorResponse, ReadyForQuery, msg_type, parse_empty};
use crate::protocol::types::TransactionStatus;

use super::connector::ConnectorState;

/// Classified backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ParseComplete,
    BindComplete,
    CloseComplete,
    /// ParameterDescription
    Parameters,
    /// RowDescription
    Columns,
    NoData,
    /// DataRow
    Row,
    /// CommandComplete
    Complete,
    EmptyQuery,
    /// CopyInResponse
    CopyIn,
    /// CopyOutResponse
    CopyOut,
    CopyData,
    CopyDone,
    /// ErrorResponse; retrieve it with `take_error()` once Ready is reached
    Error,
    /// ReadyForQuery; the command is finished
    Ready,
}

/// Tracks one command from the first frontend message to ReadyForQuery.
#[derive(Debug)]
pub struct QueryStateMachine {
    phase: ConnectorState,
    error: Option<Error>,
    transaction_status: TransactionStatus,
}

impl Default for QueryStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryStateMachine {
    pub fn new() -> Self {
        Self {
            phase: ConnectorState::Executing,
            error: None,
            transaction_status: TransactionStatus::Idle,
        }
    }

    pub fn phase(&self) -> ConnectorState {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == ConnectorState::Ready
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// The first ErrorResponse of the command, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    fn unexpected(&self, type_byte: u8) -> Error {
        Error::Protocol(format!(
            "unexpected message '{}' while {:?}",
            type_byte as char, self.phase
        ))
    }

    pub fn step(&mut self, type_byte: u8, payload: &[u8]) -> Result<Step> {
        use ConnectorState::*;

        if self.phase == Ready {
            return Err(self.unexpected(type_byte));
        }

        let step = match type_byte {
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(payload)?.into_error();
                if self.error.is_none() {
                    self.error = Some(error);
                }
                // The server leaves COPY mode and skips to Sync.
                self.phase = Executing;
                Step::Error
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                self.phase = Ready;
                Step::Ready
            }
            msg_type::PARSE_COMPLETE => {
                parse_empty(payload, "ParseComplete")?;
                Step::ParseComplete
            }
            msg_type::BIND_COMPLETE => {
                parse_empty(payload, "BindComplete")?;
                Step::BindComplete
            }
            msg_type::CLOSE_COMPLETE => {
                parse_empty(payload, "CloseComplete")?;
                Step::CloseComplete
            }
            msg_type::PARAMETER_DESCRIPTION => Step::Parameters,
            msg_type::NO_DATA => {
                parse_empty(payload, "NoData")?;
                Step::NoData
            }
            msg_type::ROW_DESCRIPTION if matches!(self.phase, Executing | Fetching) => {
                self.phase = Fetching;
                Step::Columns
            }
            msg_type::DATA_ROW if self.phase == Fetching => Step::Row,
            msg_type::COMMAND_COMPLETE => {
                self.phase = Executing;
                Step::Complete
            }
            msg_type::EMPTY_QUERY_RESPONSE if self.phase == Executing => {
                parse_empty(payload, "EmptyQueryResponse")?;
                Step::EmptyQuery
            }
            msg_type::COPY_IN_RESPONSE if matches!(self.phase, Executing | Fetching) => {
                self.phase = CopyIn;
                Step::CopyIn
            }
            msg_type::COPY_OUT_RESPONSE if matches!(self.phase, Executing | Fetching) => {
                self.phase = CopyOut;
                Step::CopyOut
            }
            msg_type::COPY_DATA if self.phase == CopyOut => Step::CopyData,
            msg_type::COPY_DONE if self.phase == CopyOut => {
                parse_empty(payload, "CopyDone")?;
                self.phase = Executing;
                Step::CopyDone
            }
            other => return Err(self.unexpected(other)),
        };
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let mut machine = QueryStateMachine::new();
        assert_eq!(machine.phase(), ConnectorState::Executing);
        assert_eq!(machine.step(b'T', &[]).unwrap(), Step::Columns);
        assert_eq!(machine.phase(), ConnectorState::Fetching);
        assert_eq!(machine.step(b'D', &[]).unwrap(), Step::Row);
        assert_eq!(machine.step(b'C', &[]).unwrap(), Step::Complete);
        assert_eq!(machine.phase(), ConnectorState::Executing);
        assert_eq!(machine.step(b'Z', b"T").unwrap(), Step::Ready);
        assert!(machine.is_ready());
        assert_eq!(machine.transaction_status(), TransactionStatus::InTransaction);
        assert!(machine.step(b'Z', b"I").is_err());
    }

    #[test]
    fn test_row_before_description_is_protocol_error() {
        let mut machine = QueryStateMachine::new();
        assert!(matches!(machine.step(b'D', &[]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_error_is_deferred_to_ready() {
        let mut machine = QueryStateMachine::new();
        machine.step(b'1', &[]).unwrap();
        let step = machine
            .step(b'E', b"SERROR\0C42P01\0Mno such table\0\0")
            .unwrap();
        assert_eq!(step, Step::Error);
        assert!(machine.has_error());
        machine.step(b'Z', b"I").unwrap();
        let err = machine.take_error().unwrap();
        assert_eq!(err.sqlstate(), Some("42P01"));
    }

    #[test]
    fn test_copy_out_sequence() {
        let mut machine = QueryStateMachine::new();
        assert_eq!(machine.step(b'H', &[]).unwrap(), Step::CopyOut);
        assert_eq!(machine.phase(), ConnectorState::CopyOut);
        assert_eq!(machine.step(b'd', b"1\n").unwrap(), Step::CopyData);
        assert_eq!(machine.step(b'c', &[]).unwrap(), Step::CopyDone);
        assert_eq!(machine.step(b'C', &[]).unwrap(), Step::Complete);
        assert_eq!(machine.step(b'Z', b"I").unwrap(), Step::Ready);
    }

    #[test]
    fn test_copy_in_failure_leaves_copy_mode() {
        let mut machine = QueryStateMachine::new();
        assert_eq!(machine.step(b'G', &[]).unwrap(), Step::CopyIn);
        assert!(machine.step(b'd', &[]).is_err());
        machine.step(b'E', b"SERROR\0C57014\0Mcanceled\0\0").unwrap();
        assert_eq!(machine.phase(), ConnectorState::Executing);
        machine.step(b'Z', b"I").unwrap();
    }

    #[test]
    fn test_framing_checked() {
        let mut machine = QueryStateMachine::new();
        assert!(matches!(machine.step(b'2', &[0]), Err(Error::Protocol(_))));
        assert!(matches!(machine.step(b's', &[]), Err(Error::Protocol(_))));
    }
}
