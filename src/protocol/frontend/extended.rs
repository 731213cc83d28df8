//! Extended query protocol messages.

use crate::error::Result;
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::{FormatCode, Oid};

/// Write a Parse message to create a prepared statement.
///
/// - `name`: Statement name (empty string for unnamed statement)
/// - `query`: SQL query with $1, $2, ... placeholders
/// - `param_oids`: Parameter type OIDs (0 = let server infer)
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_u32(oid);
    }
    msg.finish();
}

/// Write a Bind message to create a portal from a prepared statement.
///
/// Parameter values are produced by `write_values`, which must append exactly
/// `param_formats.len()` length-prefixed values. If it fails, the partially
/// written message is left in `buf` and the caller is expected to truncate it.
pub fn write_bind<F>(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    param_formats: &[FormatCode],
    write_values: F,
    result_formats: &[FormatCode],
) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr(portal);
    msg.write_cstr(statement);

    msg.write_i16(param_formats.len() as i16);
    for &fmt in param_formats {
        msg.write_i16(fmt.as_i16());
    }

    msg.write_i16(param_formats.len() as i16);
    write_values(msg.buf())?;

    msg.write_i16(result_formats.len() as i16);
    for &fmt in result_formats {
        msg.write_i16(fmt.as_i16());
    }

    msg.finish();
    Ok(())
}

/// Write an Execute message to run a portal.
///
/// - `max_rows`: Maximum number of rows to return (0 = unlimited)
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_u32(max_rows);
    msg.finish();
}

/// Write a Describe message for a statement.
pub fn write_describe_statement(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(b'S');
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Describe message for a portal.
///
/// The reply carries the result formats chosen in Bind.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Close message for a statement.
pub fn write_close_statement(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::CLOSE);
    msg.write_u8(b'S');
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Sync message.
///
/// This ends an extended query sequence; the server answers with ReadyForQuery.
pub fn write_sync(buf: &mut Vec<u8>) {
    MessageBuilder::new(buf, super::msg_type::SYNC).finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_parse() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "s1", "SELECT $1::int", &[23]);

        assert_eq!(buf[0], b'P');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
        assert!(buf.ends_with(&[0, 1, 0, 0, 0, 23]));
    }

    #[test]
    fn test_bind() {
        let mut buf = Vec::new();
        write_bind(
            &mut buf,
            "",
            "",
            &[FormatCode::Binary],
            |out| {
                out.extend_from_slice(&4_i32.to_be_bytes());
                out.extend_from_slice(&7_i32.to_be_bytes());
                Ok(())
            },
            &[FormatCode::Binary],
        )
        .unwrap();

        assert_eq!(buf[0], b'B');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
        // portal, statement, 1 format, 1 value (len + 4 bytes), 1 result format
        assert_eq!(
            &buf[5..],
            &[0, 0, 0, 1, 0, 1, 0, 1, 0, 0, 0, 4, 0, 0, 0, 7, 0, 1, 0, 1]
        );
    }

    #[test]
    fn test_bind_failure_propagates() {
        let mut buf = Vec::new();
        let result = write_bind(
            &mut buf,
            "",
            "",
            &[FormatCode::Binary],
            |_| Err(Error::Encode("bad".into())),
            &[],
        );
        assert!(matches!(result, Err(Error::Encode(_))));
    }

    #[test]
    fn test_describe_portal() {
        let mut buf = Vec::new();
        write_describe_portal(&mut buf, "");
        assert_eq!(buf, [b'D', 0, 0, 0, 6, b'P', 0]);
    }

    #[test]
    fn test_sync() {
        let mut buf = Vec::new();
        write_sync(&mut buf);
        assert_eq!(buf, [b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn test_execute() {
        let mut buf = Vec::new();
        write_execute(&mut buf, "", 0);

        assert_eq!(buf[0], b'E');
        // 4 + 1 (empty name) + 4 (max_rows)
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len, 9);
    }
}
