//! Startup, authentication and asynchronous status messages.

use zerocopy::byteorder::big_endian::U32 as U32BE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{expect_end, read_bytes, read_cstr, read_i32, read_u8, read_u32};
use crate::protocol::types::TransactionStatus;

/// Authentication method constants.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const KERBEROS_V5: i32 = 2;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const GSS: i32 = 7;
    pub const GSS_CONTINUE: i32 = 8;
    pub const SSPI: i32 = 9;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Authentication message from the server.
#[derive(Debug)]
pub enum AuthenticationMessage<'a> {
    /// Authentication successful
    Ok,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required (with 4-byte salt)
    Md5Password { salt: [u8; 4] },
    /// Kerberos, GSSAPI or SSPI challenge
    IntegratedSecurity { method: &'static str },
    /// SASL authentication required (with list of mechanisms)
    Sasl { mechanisms: Vec<&'a str> },
    /// SASL continue (with server-first-message)
    SaslContinue { data: &'a [u8] },
    /// SASL final (with server-final-message)
    SaslFinal { data: &'a [u8] },
}

impl<'a> AuthenticationMessage<'a> {
    /// Parse an Authentication message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (auth_type, rest) = read_i32(payload)?;

        let msg = match auth_type {
            auth_type::OK => {
                expect_end(rest, "AuthenticationOk")?;
                AuthenticationMessage::Ok
            }
            auth_type::CLEARTEXT_PASSWORD => {
                expect_end(rest, "AuthenticationCleartextPassword")?;
                AuthenticationMessage::CleartextPassword
            }
            auth_type::MD5_PASSWORD => {
                let (salt, rest) = read_bytes(rest, 4)?;
                expect_end(rest, "AuthenticationMD5Password")?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(salt);
                AuthenticationMessage::Md5Password { salt: buf }
            }
            auth_type::KERBEROS_V5 => AuthenticationMessage::IntegratedSecurity {
                method: "Kerberos V5",
            },
            auth_type::GSS | auth_type::GSS_CONTINUE => {
                AuthenticationMessage::IntegratedSecurity { method: "GSSAPI" }
            }
            auth_type::SSPI => AuthenticationMessage::IntegratedSecurity { method: "SSPI" },
            auth_type::SASL => {
                let mut mechanisms = Vec::new();
                let mut data = rest;
                loop {
                    let (mechanism, remaining) = read_cstr(data)?;
                    data = remaining;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                expect_end(data, "AuthenticationSASL")?;
                AuthenticationMessage::Sasl { mechanisms }
            }
            auth_type::SASL_CONTINUE => AuthenticationMessage::SaslContinue { data: rest },
            auth_type::SASL_FINAL => AuthenticationMessage::SaslFinal { data: rest },
            _ => {
                return Err(Error::Protocol(format!(
                    "Unknown authentication type: {}",
                    auth_type
                )));
            }
        };
        Ok(msg)
    }
}

/// BackendKeyData message - contains process ID and secret key for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    pid: U32BE,
    secret_key: U32BE,
}

impl BackendKeyData {
    /// Parse a BackendKeyData message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Self::read_from_bytes(payload)
            .map_err(|e| Error::Protocol(format!("BackendKeyData: {e:?}")))
    }

    /// Get the process ID.
    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    /// Get the secret key.
    pub fn secret(&self) -> u32 {
        self.secret_key.get()
    }
}

/// ParameterStatus message - server parameter name and value.
#[derive(Debug, Clone)]
pub struct ParameterStatus<'a> {
    /// Parameter name
    pub name: &'a str,
    /// Parameter value
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    /// Parse a ParameterStatus message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (name, rest) = read_cstr(payload)?;
        let (value, rest) = read_cstr(rest)?;
        expect_end(rest, "ParameterStatus")?;
        Ok(Self { name, value })
    }
}

/// ReadyForQuery message - indicates server is ready for a new query.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// Transaction status
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    /// Parse a ReadyForQuery message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (byte, rest) = read_u8(payload)?;
        expect_end(rest, "ReadyForQuery")?;
        let status = TransactionStatus::from_byte(byte).ok_or_else(|| {
            Error::Protocol(format!("ReadyForQuery: unknown status '{}'", byte as char))
        })?;
        Ok(Self { status })
    }
}

/// NotificationResponse message - asynchronous notification from LISTEN/NOTIFY.
#[derive(Debug, Clone)]
pub struct NotificationResponse<'a> {
    /// PID of the notifying backend
    pub pid: u32,
    /// Channel name
    pub channel: &'a str,
    /// Notification payload
    pub payload: &'a str,
}

impl<'a> NotificationResponse<'a> {
    /// Parse a NotificationResponse message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (pid, rest) = read_u32(payload)?;
        let (channel, rest) = read_cstr(rest)?;
        let (payload_str, rest) = read_cstr(rest)?;
        expect_end(rest, "NotificationResponse")?;
        Ok(Self {
            pid,
            channel,
            payload: payload_str,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_request() {
        let payload = [0, 0, 0, 5, 1, 2, 3, 4];
        match AuthenticationMessage::parse(&payload).unwrap() {
            AuthenticationMessage::Md5Password { salt } => assert_eq!(salt, [1, 2, 3, 4]),
            other => panic!("unexpected {:?}", other),
        }
        // Salt is exactly four bytes
        assert!(AuthenticationMessage::parse(&[0, 0, 0, 5, 1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_sasl_mechanisms() {
        let mut payload = 10_i32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"SCRAM-SHA-256\0SCRAM-SHA-256-PLUS\0\0");
        match AuthenticationMessage::parse(&payload).unwrap() {
            AuthenticationMessage::Sasl { mechanisms } => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256", "SCRAM-SHA-256-PLUS"])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gss_is_integrated_security() {
        assert!(matches!(
            AuthenticationMessage::parse(&7_i32.to_be_bytes()).unwrap(),
            AuthenticationMessage::IntegratedSecurity { method: "GSSAPI" }
        ));
    }

    #[test]
    fn test_backend_key_data() {
        let payload = [0, 0, 0x30, 0x39, 0xde, 0xad, 0xbe, 0xef];
        let key = BackendKeyData::parse(&payload).unwrap();
        assert_eq!(key.process_id(), 12345);
        assert_eq!(key.secret(), 0xdeadbeef);
        assert!(BackendKeyData::parse(&payload[..7]).is_err());
    }

    #[test]
    fn test_ready_for_query_exact() {
        assert_eq!(
            ReadyForQuery::parse(b"T").unwrap().status,
            TransactionStatus::InTransaction
        );
        assert!(ReadyForQuery::parse(b"TT").is_err());
        assert!(ReadyForQuery::parse(b"Q").is_err());
    }

    #[test]
    fn test_notification() {
        let mut payload = 42_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"jobs\0ready\0");
        let n = NotificationResponse::parse(&payload).unwrap();
        assert_eq!(n.pid, 42);
        assert_eq!(n.channel, "jobs");
        assert_eq!(n.payload, "ready");
    }
}
