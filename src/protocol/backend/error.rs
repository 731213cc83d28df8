//! Error and notice response messages.

use crate::error::{Error, ErrorFields, Result};
use crate::protocol::codec::{expect_end, read_cstr};

/// Error field type codes from PostgreSQL protocol.
pub mod field_type {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_NON_LOCALIZED: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// Parse error/notice fields from payload.
///
/// The field list ends with a single zero byte that must be the last byte of the payload.
fn parse_fields(payload: &[u8]) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    let mut data = payload;

    loop {
        let Some((&field, rest)) = data.split_first() else {
            return Err(Error::Protocol("error fields: missing terminator".into()));
        };
        if field == 0 {
            expect_end(rest, "ErrorResponse")?;
            break;
        }

        let (value, rest) = read_cstr(rest)?;
        data = rest;

        let slot = match field {
            field_type::SEVERITY => &mut fields.severity,
            field_type::SEVERITY_NON_LOCALIZED => &mut fields.severity_non_localized,
            field_type::CODE => &mut fields.code,
            field_type::MESSAGE => &mut fields.message,
            field_type::DETAIL => &mut fields.detail,
            field_type::HINT => &mut fields.hint,
            field_type::INTERNAL_QUERY => &mut fields.internal_query,
            field_type::WHERE => &mut fields.where_,
            field_type::SCHEMA => &mut fields.schema,
            field_type::TABLE => &mut fields.table,
            field_type::COLUMN => &mut fields.column,
            field_type::DATA_TYPE => &mut fields.data_type,
            field_type::CONSTRAINT => &mut fields.constraint,
            field_type::FILE => &mut fields.file,
            field_type::ROUTINE => &mut fields.routine,
            field_type::POSITION => {
                fields.position = value.parse().ok();
                continue;
            }
            field_type::INTERNAL_POSITION => {
                fields.internal_position = value.parse().ok();
                continue;
            }
            field_type::LINE => {
                fields.line = value.parse().ok();
                continue;
            }
            _ => {
                tracing::debug!("Unknown error field type: {}", field as char);
                continue;
            }
        };
        *slot = Some(value.to_string());
    }

    Ok(fields)
}

/// ErrorResponse message - error raised by the server for the in-flight request.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    /// Parsed error fields
    pub fields: ErrorFields,
}

impl ErrorResponse {
    /// Parse an ErrorResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }

    /// Convert to an Error.
    pub fn into_error(self) -> Error {
        Error::Server(self.fields)
    }
}

/// NoticeResponse message - non-fatal warning/info from server.
#[derive(Debug, Clone)]
pub struct NoticeResponse {
    /// Parsed notice fields
    pub fields: ErrorFields,
}

impl NoticeResponse {
    /// Parse a NoticeResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            fields: parse_fields(payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let payload = b"SERROR\0VERROR\0C28P01\0Mpassword authentication failed for user \"bob\"\0P12\0\0";
        let err = ErrorResponse::parse(payload).unwrap();
        assert_eq!(err.fields.code.as_deref(), Some("28P01"));
        assert_eq!(err.fields.severity(), Some("ERROR"));
        assert_eq!(err.fields.position, Some(12));
        assert_eq!(err.into_error().sqlstate(), Some("28P01"));
    }

    #[test]
    fn test_unknown_field_is_skipped() {
        let notice = NoticeResponse::parse(b"SNOTICE\0Zsomething\0Mhello\0\0").unwrap();
        assert_eq!(notice.fields.message.as_deref(), Some("hello"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(ErrorResponse::parse(b"SERROR\0\0x").is_err());
        assert!(ErrorResponse::parse(b"SERROR\0").is_err());
    }
}
