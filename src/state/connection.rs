//! Connection startup and authentication state machine.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, NoticeResponse, ParameterStatus,
    ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::Action;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Phase of the startup handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    Initial,
    WaitingSslResponse,
    SslHandshake,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Startup state machine: SSL negotiation, authentication, and the
/// BackendKeyData/ParameterStatus burst up to the first ReadyForQuery.
pub struct StartupStateMachine {
    phase: StartupPhase,
    opts: Arc<Opts>,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
}

impl StartupStateMachine {
    pub fn new(opts: Arc<Opts>) -> Self {
        Self {
            phase: StartupPhase::Initial,
            opts,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
        }
    }

    pub fn phase(&self) -> StartupPhase {
        self.phase
    }

    /// Backend key data for cancellation.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Start the handshake, writing the first message into `out`.
    pub fn start(&mut self, out: &mut Vec<u8>) -> Action {
        out.clear();
        match self.opts.ssl_mode {
            SslMode::Disable => {
                self.write_startup_message(out);
                self.phase = StartupPhase::WaitingAuth;
                Action::WriteAndReadMessage
            }
            SslMode::Prefer | SslMode::Require => {
                write_ssl_request(out);
                self.phase = StartupPhase::WaitingSslResponse;
                Action::WriteAndReadByte
            }
        }
    }

    /// Process the SSL response byte ('S' or 'N').
    pub fn ssl_response(&mut self, response: u8, out: &mut Vec<u8>) -> Result<Action> {
        if self.phase != StartupPhase::WaitingSslResponse {
            return Err(self.fail_protocol("SSL response outside SSL negotiation"));
        }
        match response {
            b'S' => {
                self.phase = StartupPhase::SslHandshake;
                Ok(Action::TlsHandshake)
            }
            b'N' if self.opts.ssl_mode == SslMode::Require => {
                self.phase = StartupPhase::Failed;
                Err(Error::Unsupported(
                    "SSL required but not supported by server".into(),
                ))
            }
            b'N' => {
                tracing::debug!("server declined SSL, continuing unencrypted");
                out.clear();
                self.write_startup_message(out);
                self.phase = StartupPhase::WaitingAuth;
                Ok(Action::WriteAndReadMessage)
            }
            other => Err(self.fail_protocol(&format!("unexpected SSL response: {}", other))),
        }
    }

    /// Called after the TLS handshake completes.
    pub fn tls_established(&mut self, out: &mut Vec<u8>) -> Action {
        out.clear();
        self.write_startup_message(out);
        self.phase = StartupPhase::WaitingAuth;
        Action::WriteAndReadMessage
    }

    /// Process one backend message. Any reply is written into `out`.
    pub fn step(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<Action> {
        match type_byte {
            msg_type::ERROR_RESPONSE => {
                self.phase = StartupPhase::Failed;
                return Err(ErrorResponse::parse(payload)?.into_error());
            }
            msg_type::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(payload)?;
                tracing::debug!(notice = %notice.fields, "notice during startup");
                return Ok(Action::ReadMessage);
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                tracing::debug!("server negotiated protocol version down");
                return Ok(Action::ReadMessage);
            }
            _ => {}
        }

        let result = match self.phase {
            StartupPhase::WaitingAuth => self.handle_auth(type_byte, payload, out),
            StartupPhase::SaslInProgress => self.handle_sasl(type_byte, payload, out),
            StartupPhase::WaitingAuthResult => self.handle_auth_result(type_byte, payload),
            StartupPhase::WaitingReady => self.handle_ready(type_byte, payload),
            phase => Err(Error::Protocol(format!(
                "unexpected message '{}' in startup phase {:?}",
                type_byte as char, phase
            ))),
        };
        if result.is_err() {
            self.phase = StartupPhase::Failed;
        }
        result
    }

    fn fail_protocol(&mut self, message: &str) -> Error {
        self.phase = StartupPhase::Failed;
        Error::Protocol(message.to_string())
    }

    fn write_startup_message(&self, out: &mut Vec<u8>) {
        let mut params: Vec<(&str, &str)> =
            vec![("user", &self.opts.user), ("client_encoding", "UTF8")];
        if let Some(db) = &self.opts.database {
            params.push(("database", db));
        }
        if let Some(app) = &self.opts.application_name {
            params.push(("application_name", app));
        }
        for (name, value) in &self.opts.params {
            params.push((name, value));
        }
        write_startup(out, &params);
    }

    fn password(&self) -> Result<&str> {
        self.opts
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("password required but not provided".into()))
    }

    fn expect_auth<'a>(&self, type_byte: u8, payload: &'a [u8]) -> Result<AuthenticationMessage<'a>> {
        if type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                type_byte as char
            )));
        }
        AuthenticationMessage::parse(payload)
    }

    fn handle_auth(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<Action> {
        let auth = self.expect_auth(type_byte, payload)?;
        out.clear();
        match auth {
            AuthenticationMessage::Ok => {
                tracing::debug!("authenticated without password");
                self.phase = StartupPhase::WaitingReady;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                tracing::debug!("authenticating with cleartext password");
                write_password(out, self.password()?);
                self.phase = StartupPhase::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Md5Password { salt } => {
                tracing::debug!("authenticating with MD5 password");
                let hashed = md5_password(&self.opts.user, self.password()?, &salt);
                write_password(out, &hashed);
                self.phase = StartupPhase::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::Unsupported(format!(
                        "no supported SASL mechanism, server offers {:?}",
                        mechanisms
                    )));
                }
                tracing::debug!("authenticating with SCRAM-SHA-256");
                let scram = ScramClient::new(self.password()?);
                write_sasl_initial_response(
                    out,
                    SCRAM_SHA_256,
                    scram.client_first_message().as_bytes(),
                );
                self.scram_client = Some(scram);
                self.phase = StartupPhase::SaslInProgress;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::IntegratedSecurity { method } => Err(Error::Unsupported(
                format!("{} authentication is not supported", method),
            )),
            other => Err(Error::Protocol(format!(
                "unexpected authentication request: {:?}",
                other
            ))),
        }
    }

    fn handle_sasl(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<Action> {
        let auth = self.expect_auth(type_byte, payload)?;
        let scram = self
            .scram_client
            .as_mut()
            .ok_or_else(|| Error::Protocol("SCRAM exchange not started".into()))?;
        match auth {
            AuthenticationMessage::SaslContinue { data } => {
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-first-message: {}", e)))?;
                let client_final = scram.process_server_first(server_first)?;
                out.clear();
                write_sasl_response(out, client_final.as_bytes());
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-final-message: {}", e)))?;
                scram.verify_server_final(server_final)?;
                self.phase = StartupPhase::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected SASL message: {:?}",
                other
            ))),
        }
    }

    fn handle_auth_result(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        match self.expect_auth(type_byte, payload)? {
            AuthenticationMessage::Ok => {
                self.phase = StartupPhase::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!(
                "unexpected authentication result: {:?}",
                other
            ))),
        }
    }

    fn handle_ready(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action> {
        match type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_key = Some(BackendKeyData::parse(payload)?);
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(payload)?.status;
                self.phase = StartupPhase::Ready;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}
