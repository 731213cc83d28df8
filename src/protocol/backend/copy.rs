//! COPY protocol backend messages.

use crate::error::{Error, Result};
use crate::protocol::codec::{expect_end, read_i16, read_u8, read_u16};
use crate::protocol::types::FormatCode;

/// CopyInResponse / CopyOutResponse payload.
///
/// Both messages share the same layout: the overall format followed by one
/// format code per column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResponse {
    /// Overall format (0=text, 1=binary)
    pub format: FormatCode,
    /// Per-column format codes
    pub column_formats: Vec<FormatCode>,
}

impl CopyResponse {
    /// Parse a CopyInResponse or CopyOutResponse payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (format_byte, rest) = read_u8(payload)?;
        let format = FormatCode::from_wire(format_byte as u16).ok_or_else(|| {
            Error::Protocol(format!("CopyResponse: bad overall format {}", format_byte))
        })?;

        let (num_columns, mut rest) = read_i16(rest)?;
        if num_columns < 0 {
            return Err(Error::Protocol(format!(
                "CopyResponse: negative column count {}",
                num_columns
            )));
        }

        let mut column_formats = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let (fmt, remaining) = read_u16(rest)?;
            column_formats.push(FormatCode::from_wire(fmt).ok_or_else(|| {
                Error::Protocol(format!("CopyResponse: bad column format {}", fmt))
            })?);
            rest = remaining;
        }
        expect_end(rest, "CopyResponse")?;

        Ok(Self {
            format,
            column_formats,
        })
    }

    /// Check if binary format is used.
    pub fn is_binary(&self) -> bool {
        matches!(self.format, FormatCode::Binary)
    }

    /// Number of columns being copied.
    pub fn num_columns(&self) -> usize {
        self.column_formats.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_in_response() {
        let payload = [1, 0, 2, 0, 1, 0, 1];
        let resp = CopyResponse::parse(&payload).unwrap();
        assert!(resp.is_binary());
        assert_eq!(resp.num_columns(), 2);
    }

    #[test]
    fn test_copy_response_truncated() {
        assert!(CopyResponse::parse(&[0, 0, 2, 0, 0]).is_err());
        assert!(CopyResponse::parse(&[0, 0, 0, 9]).is_err());
    }
}
