//! The socket-owning half of a connector.
//!
//! A `Session` is only ever touched through the connector's mutex. Every
//! command leaves it either `Ready` or in a state the next command knows how
//! to recover from: a partially read response is drained, an abandoned COPY IN
//! is failed, and a partially written message condemns the session.

use std::collections::VecDeque;
use std::io;
use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::buffer_pool::PooledBufferSet;
use crate::buffer_set::{BufferSet, ReadBuffer};
use crate::error::{Error, Result};
use crate::events::{Notice, Notification};
use crate::opts::Opts;
use crate::protocol::RawMessage;
use crate::protocol::backend::{
    BackendKeyData, CommandComplete, CopyResponse, DataRow, ErrorResponse, NoticeResponse,
    NotificationResponse, ParameterDescription, ParameterStatus, ReadyForQuery, RowDescription,
    msg_type,
};
use crate::protocol::frontend::{
    write_bind, write_cancel_request, write_close_statement, write_copy_data, write_copy_done,
    write_copy_fail, write_describe_portal, write_describe_statement, write_execute, write_parse,
    write_query, write_sync, write_terminate,
};
use crate::protocol::types::{FormatCode, Oid};
use crate::row::{Column, Row};
use crate::state::{Action, ConnectorState, QueryStateMachine, StartupStateMachine, Step};
use crate::types::enums::global_enums;
use crate::types::{TypeRegistry, Value};

use super::params::BackendParams;
use super::shared::{Claim, Shared};
use super::statement::Statement;
use super::stream::Stream;

/// Notifications kept for `wait_for_notification` before the oldest is dropped.
const MAX_QUEUED_NOTIFICATIONS: usize = 1024;

/// Upper bound on draining a cancelled command.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const TYPE_LOOKUP_SQL: &str = "SELECT oid, typarray FROM pg_type WHERE oid = to_regtype($1)";

const ENUM_LABELS_SQL: &str =
    "SELECT enumlabel::text FROM pg_enum WHERE enumtypid = $1 ORDER BY enumsortorder";

/// Direction of a COPY command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// COPY ... FROM STDIN
    In,
    /// COPY ... TO STDOUT
    Out,
}

/// Progress of one command's response.
#[derive(Debug)]
pub(crate) struct QueryCursor {
    machine: QueryStateMachine,
    columns: Option<Arc<[Column]>>,
    rows_affected: u64,
    done: bool,
}

impl QueryCursor {
    fn new() -> Self {
        Self {
            machine: QueryStateMachine::new(),
            columns: None,
            rows_affected: 0,
            done: false,
        }
    }

    pub fn columns(&self) -> &[Column] {
        self.columns.as_deref().unwrap_or(&[])
    }

    /// Sum of the counts in the CommandComplete tags seen so far.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Stop handing out results; the session drains the rest on next use.
    pub fn abandon(&mut self) {
        self.done = true;
    }
}

pub(crate) struct Session {
    stream: Stream,
    bufs: PooledBufferSet,
    pub registry: TypeRegistry,
    shared: Arc<Shared>,
    opts: Arc<Opts>,
    backend_key: Option<BackendKeyData>,
    stmt_counter: u64,
    /// Set while a message is partially written to the socket
    write_pending: bool,
    terminated: bool,
    notifications: VecDeque<Notification>,
}

async fn read_frame(
    stream: &mut Stream,
    read: &mut ReadBuffer,
    limit: Option<Duration>,
) -> Result<(u8, Range<usize>)> {
    loop {
        if let Some(frame) = read.next_frame()? {
            return Ok(frame);
        }
        let n = match limit {
            Some(limit) => tokio::time::timeout(limit, stream.read_buf(read.spare()))
                .await
                .map_err(|_| {
                    Error::Timeout(format!("no response from the server within {:?}", limit))
                })??,
            None => stream.read_buf(read.spare()).await?,
        };
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
    }
}

/// Ask the server to cancel whatever the identified backend is running.
pub(crate) async fn send_cancel(opts: &Opts, key: BackendKeyData) -> Result<()> {
    let mut stream = tokio::time::timeout(opts.connect_timeout, Stream::connect(opts))
        .await
        .map_err(|_| Error::Timeout("cancel request could not connect".into()))??;
    let mut buf = Vec::with_capacity(16);
    write_cancel_request(&mut buf, key.process_id(), key.secret());
    stream.write_all(&buf).await?;
    stream.flush().await?;
    // The server closes the socket once the request is processed.
    let mut sink = Vec::new();
    let _ = tokio::time::timeout(opts.connect_timeout, stream.read_buf(&mut sink)).await;
    tracing::debug!(pid = key.process_id(), "sent cancel request");
    Ok(())
}

impl Session {
    /// Open the transport and run the startup handshake.
    pub async fn connect(opts: Arc<Opts>, shared: Arc<Shared>) -> Result<Self> {
        let mut stream = Stream::connect(&opts).await?;
        let mut bufs = opts.buffer_pool.get_buffer_set();
        let mut machine = StartupStateMachine::new(Arc::clone(&opts));

        let BufferSet {
            read, write_buffer, ..
        } = &mut *bufs;
        let mut action = machine.start(write_buffer);
        shared.set_state(ConnectorState::Authenticating);

        loop {
            match action {
                Action::WriteAndReadByte => {
                    stream.write_all(write_buffer).await?;
                    stream.flush().await?;
                    let response = stream.read_u8().await?;
                    action = machine.ssl_response(response, write_buffer)?;
                }
                Action::WriteAndReadMessage | Action::ReadMessage => {
                    if action == Action::WriteAndReadMessage {
                        stream.write_all(write_buffer).await?;
                        stream.flush().await?;
                    }
                    let (type_byte, range) = read_frame(&mut stream, read, None).await?;
                    action = machine.step(type_byte, read.slice(range), write_buffer)?;
                }
                Action::TlsHandshake => {
                    stream = stream.upgrade_to_tls(&opts.host).await?;
                    tracing::debug!("TLS established");
                    action = machine.tls_established(write_buffer);
                }
                Action::Finished => break,
            }
        }
        write_buffer.clear();

        let backend_key = machine.backend_key().copied();
        let mut params = BackendParams::new(machine.take_server_params());
        if let Some(key) = &backend_key {
            params.set_backend_key(key.process_id(), key.secret());
        }
        tracing::debug!(
            pid = backend_key.map(|k| k.process_id()),
            server_version = params.server_version(),
            "connector authenticated"
        );
        shared.update_params(|p| *p = params);
        shared.set_transaction_status(machine.transaction_status());

        Ok(Self {
            stream,
            bufs,
            registry: TypeRegistry::builtin(),
            shared,
            opts,
            backend_key,
            stmt_counter: 0,
            write_pending: false,
            terminated: false,
            notifications: VecDeque::new(),
        })
    }

    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    pub fn process_id(&self) -> u32 {
        self.backend_key.map_or(0, |k| k.process_id())
    }

    pub fn supports_nonblocking_read(&self) -> bool {
        !self.stream.is_tls()
    }

    /// Payload of a frame returned by `recv`. Valid until the next read.
    pub fn payload(&self, range: Range<usize>) -> &[u8] {
        self.bufs.read.slice(range)
    }

    /// Fails once `close()` ran while this session was in use.
    fn check_open(&self) -> Result<()> {
        if self.shared.close_requested() {
            return Err(Error::InvalidUsage("connector is closed".into()));
        }
        Ok(())
    }

    async fn flush_writes(&mut self) -> Result<()> {
        self.check_open()?;
        self.write_pending = true;
        self.stream.write_all(&self.bufs.write_buffer).await?;
        self.stream.flush().await?;
        self.write_pending = false;
        self.bufs.write_buffer.clear();
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<(u8, Range<usize>)> {
        read_frame(&mut self.stream, &mut self.bufs.read, self.opts.command_timeout).await
    }

    /// Next message of the running command. Async messages are dispatched on the way.
    pub async fn recv(&mut self) -> Result<(u8, Range<usize>)> {
        self.check_open()?;
        loop {
            let (type_byte, range) = self.read_frame().await?;
            if RawMessage::is_async_type(type_byte) {
                self.dispatch_async(type_byte, range)?;
                continue;
            }
            return Ok((type_byte, range));
        }
    }

    fn dispatch_async(&mut self, type_byte: u8, range: Range<usize>) -> Result<()> {
        let payload = self.bufs.read.slice(range);
        match type_byte {
            msg_type::PARAMETER_STATUS => {
                let status = ParameterStatus::parse(payload)?;
                tracing::debug!(name = status.name, value = status.value, "server parameter");
                self.shared.update_params(|p| p.set(status.name, status.value));
            }
            msg_type::NOTICE_RESPONSE => {
                let notice = Notice {
                    fields: NoticeResponse::parse(payload)?.fields,
                };
                self.shared.notice_listeners.emit(&notice);
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let response = NotificationResponse::parse(payload)?;
                let notification = Notification {
                    process_id: response.pid,
                    channel: response.channel.to_string(),
                    payload: response.payload.to_string(),
                };
                self.shared.notification_listeners.emit(&notification);
                if self.notifications.len() == MAX_QUEUED_NOTIFICATIONS {
                    tracing::warn!("notification queue full, dropping the oldest");
                    self.notifications.pop_front();
                }
                self.notifications.push_back(notification);
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_command(&mut self, cursor: &mut QueryCursor) -> Result<()> {
        cursor.done = true;
        self.shared
            .set_transaction_status(cursor.machine.transaction_status());
        self.shared.set_state(ConnectorState::Ready);
        match cursor.machine.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_command(&mut self) -> Result<QueryCursor> {
        self.shared.set_state(ConnectorState::Executing);
        self.flush_writes().await?;
        Ok(QueryCursor::new())
    }

    // === Recovery ===

    /// Bring the session back to Ready after an abandoned operation, and run
    /// a rollback left behind by a dropped transaction.
    pub async fn ensure_ready(&mut self) -> Result<()> {
        self.shared.check_usable()?;
        if self.write_pending {
            let err = Error::Protocol("an earlier operation was interrupted mid-write".into());
            self.shared.mark_broken(&err);
            return Err(Error::ConnectionBroken);
        }

        let state = self.shared.state();
        if state != ConnectorState::Ready {
            tracing::debug!(?state, "recovering from an unfinished operation");
            if let Err(err) = self.recover_protocol(state).await {
                self.shared.mark_broken(&err);
                return Err(err);
            }
        }

        if self.shared.take_rollback_pending() && self.shared.transaction_status().in_transaction()
        {
            tracing::debug!("rolling back an abandoned transaction");
            if let Err(err) = self.execute_simple("ROLLBACK").await {
                if err.is_connection_broken() || err.is_timeout() {
                    self.shared.mark_broken(&err);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn recover_protocol(&mut self, state: ConnectorState) -> Result<()> {
        if state == ConnectorState::CopyIn {
            self.bufs.write_buffer.clear();
            write_copy_fail(&mut self.bufs.write_buffer, "COPY abandoned by the client");
            self.flush_writes().await?;
        }
        self.drain_to_ready().await
    }

    async fn drain_to_ready(&mut self) -> Result<()> {
        loop {
            let (type_byte, range) = self.recv().await?;
            match type_byte {
                msg_type::READY_FOR_QUERY => {
                    let status = ReadyForQuery::parse(self.payload(range))?.status;
                    self.shared.set_transaction_status(status);
                    self.shared.set_state(ConnectorState::Ready);
                    return Ok(());
                }
                // The server waits for data that will never come.
                msg_type::COPY_IN_RESPONSE => {
                    self.bufs.write_buffer.clear();
                    write_copy_fail(&mut self.bufs.write_buffer, "COPY abandoned by the client");
                    self.flush_writes().await?;
                }
                _ => {}
            }
        }
    }

    /// Map the outcome of a command onto the session state.
    ///
    /// Timeouts cancel the command server-side and drain it; transport and
    /// framing errors condemn the session.
    pub async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_timeout() {
            return Err(self.cancel_after_timeout(err).await);
        }
        if err.is_connection_broken() {
            self.shared.mark_broken(&err);
        }
        Err(err)
    }

    async fn cancel_after_timeout(&mut self, err: Error) -> Error {
        let state = self.shared.state();
        if !state.is_busy() {
            return err;
        }
        tracing::warn!(error = %err, ?state, "command timed out, cancelling");
        if let Some(key) = self.backend_key {
            if let Err(cancel_err) = send_cancel(&self.opts, key).await {
                tracing::debug!(error = %cancel_err, "cancel request failed");
            }
        }
        match tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, self.recover_protocol(state)).await {
            Ok(Ok(())) => {}
            Ok(Err(drain_err)) => self.shared.mark_broken(&drain_err),
            Err(_) => self.shared.mark_broken(&Error::Timeout(
                "server did not acknowledge the cancellation".into(),
            )),
        }
        err
    }

    // === Commands ===

    /// Send a simple-protocol query.
    pub async fn start_simple(&mut self, sql: &str) -> Result<QueryCursor> {
        self.bufs.write_buffer.clear();
        write_query(&mut self.bufs.write_buffer, sql);
        self.send_command().await
    }

    /// Next row of the running command, or None once it is finished.
    pub async fn next_row(&mut self, cursor: &mut QueryCursor) -> Result<Option<Row>> {
        while !cursor.done {
            let (type_byte, range) = self.recv().await?;
            let step = cursor.machine.step(type_byte, self.payload(range.clone()))?;
            if step != Step::Ready {
                self.shared.set_state(cursor.machine.phase());
            }
            match step {
                Step::Columns => {
                    let description = RowDescription::parse(self.payload(range))?;
                    let columns = description
                        .fields()
                        .iter()
                        .map(|field| Ok(Column::from_field(field, field.format()?)))
                        .collect::<Result<Vec<_>>>()?;
                    cursor.columns = Some(columns.into());
                }
                Step::Row => {
                    let columns = cursor.columns.as_ref().ok_or_else(|| {
                        Error::Protocol("DataRow without a row description".into())
                    })?;
                    let data = DataRow::parse(self.bufs.read.slice(range))?;
                    return Row::decode(columns, &data, &self.registry).map(Some);
                }
                Step::Complete => {
                    let complete = CommandComplete::parse(self.payload(range))?;
                    cursor.rows_affected += complete.rows_affected().unwrap_or(0);
                }
                Step::CopyIn => {
                    self.bufs.write_buffer.clear();
                    write_copy_fail(
                        &mut self.bufs.write_buffer,
                        "COPY FROM STDIN needs a COPY importer",
                    );
                    self.flush_writes().await?;
                }
                Step::Ready => {
                    self.finish_command(cursor)?;
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Read the command to its end and return the affected row count.
    pub async fn drain(&mut self, cursor: &mut QueryCursor) -> Result<u64> {
        while self.next_row(cursor).await?.is_some() {}
        Ok(cursor.rows_affected)
    }

    pub async fn execute_simple(&mut self, sql: &str) -> Result<u64> {
        let mut cursor = self.start_simple(sql).await?;
        self.drain(&mut cursor).await
    }

    /// Keepalive and `Connector::ping`.
    pub async fn ping(&mut self) -> Result<()> {
        self.execute_simple("").await.map(|_| ())
    }

    pub fn next_statement_name(&mut self) -> String {
        self.stmt_counter += 1;
        format!("pgc_{}", self.stmt_counter)
    }

    /// Parse and describe a statement. `name` may be empty for the unnamed statement.
    pub async fn prepare(&mut self, name: &str, sql: &str, param_oids: &[Oid]) -> Result<Statement> {
        let buf = &mut self.bufs.write_buffer;
        buf.clear();
        write_parse(buf, name, sql, param_oids);
        write_describe_statement(buf, name);
        write_sync(buf);
        let mut cursor = self.send_command().await?;

        let mut declared = Vec::new();
        let mut columns = Vec::new();
        loop {
            let (type_byte, range) = self.recv().await?;
            let step = cursor.machine.step(type_byte, self.payload(range.clone()))?;
            match step {
                Step::Parameters => {
                    declared = ParameterDescription::parse(self.payload(range))?.into_oids();
                }
                Step::Columns => {
                    let description = RowDescription::parse(self.payload(range))?;
                    columns = description
                        .fields()
                        .iter()
                        .map(|field| Column::from_field(field, FormatCode::Text))
                        .collect();
                }
                Step::Ready => break,
                _ => {}
            }
        }
        self.finish_command(&mut cursor)?;

        Ok(Statement {
            name: name.to_string(),
            sql: sql.to_string(),
            param_oids: declared,
            columns: columns.into(),
            process_id: self.process_id(),
        })
    }

    /// Bind `params` to a parsed statement and start executing it.
    ///
    /// Every parameter is validated before anything is written, so an encode
    /// error leaves the session Ready.
    pub async fn bind_execute(&mut self, statement: &Statement, params: &[Value]) -> Result<QueryCursor> {
        let plan = self.registry.plan_params(&statement.param_oids, params)?;
        let result_formats: Vec<FormatCode> = statement
            .columns
            .iter()
            .map(|c| self.registry.result_format(c.type_oid()))
            .collect();

        let buf = &mut self.bufs.write_buffer;
        buf.clear();
        write_bind(
            buf,
            "",
            &statement.name,
            &plan.formats(),
            |out| plan.write(params, out),
            &result_formats,
        )
        .inspect_err(|_| buf.clear())?;
        write_describe_portal(buf, "");
        write_execute(buf, "", 0);
        write_sync(buf);
        self.send_command().await
    }

    /// Extended-protocol query through the unnamed statement.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryCursor> {
        let oids: Vec<Oid> = params.iter().map(|v| self.registry.natural_oid(v)).collect();
        let statement = self.prepare("", sql, &oids).await?;
        self.bind_execute(&statement, params).await
    }

    pub async fn query_rows(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut cursor = self.query(sql, params).await?;
        let mut rows = Vec::new();
        while let Some(row) = self.next_row(&mut cursor).await? {
            rows.push(row);
        }
        Ok(rows)
    }

    pub async fn close_statement(&mut self, name: &str) -> Result<()> {
        let buf = &mut self.bufs.write_buffer;
        buf.clear();
        write_close_statement(buf, name);
        write_sync(buf);
        let mut cursor = self.send_command().await?;
        self.drain(&mut cursor).await.map(|_| ())
    }

    // === Types ===

    /// OID and array OID of a server type, or None if it does not exist.
    pub async fn lookup_type(&mut self, name: &str) -> Result<Option<(Oid, Oid)>> {
        let rows = self
            .query_rows(TYPE_LOOKUP_SQL, &[Value::Text(name.to_string())])
            .await?;
        rows.first()
            .map(|row| Ok((row.get::<u32>(0)?, row.get::<u32>(1)?)))
            .transpose()
    }

    /// Labels of an enum type as the server defines them, in sort order.
    pub async fn enum_labels(&mut self, oid: Oid) -> Result<Vec<String>> {
        let rows = self.query_rows(ENUM_LABELS_SQL, &[Value::Oid(oid)]).await?;
        rows.iter().map(|row| row.get::<String>(0)).collect()
    }

    /// Resolve `name` and check `labels` against the server's definition.
    async fn resolve_enum(&mut self, name: &str, labels: &[String]) -> Result<Option<(Oid, Oid)>> {
        let Some((oid, array_oid)) = self.lookup_type(name).await? else {
            return Ok(None);
        };
        let server = self.enum_labels(oid).await?;
        if server.is_empty() {
            return Err(Error::InvalidUsage(format!("type {:?} is not an enum", name)));
        }
        if let Some(missing) = labels.iter().find(|&label| !server.contains(label)) {
            return Err(Error::Encode(format!(
                "label {:?} is not part of enum {} on the server (labels: {:?})",
                missing, name, server
            )));
        }
        if server.len() > labels.len() {
            tracing::warn!(name, ?server, "enum has labels the client did not register");
        }
        Ok(Some((oid, array_oid)))
    }

    pub async fn register_enum(&mut self, name: &str, labels: Vec<String>) -> Result<()> {
        let (oid, array_oid) = self
            .resolve_enum(name, &labels)
            .await?
            .ok_or_else(|| Error::InvalidUsage(format!("type {:?} does not exist", name)))?;
        self.registry.register_enum(name, oid, Some(array_oid), labels);
        Ok(())
    }

    /// Resolve the global enum registrations against this database.
    pub async fn load_global_types(&mut self) -> Result<()> {
        for (name, labels) in global_enums() {
            match self.resolve_enum(&name, &labels).await {
                Ok(Some((oid, array_oid))) => {
                    self.registry.register_enum(&name, oid, Some(array_oid), labels);
                }
                Ok(None) => {
                    tracing::warn!(name, "globally registered enum does not exist in this database");
                }
                Err(Error::InvalidUsage(reason) | Error::Encode(reason)) => {
                    tracing::warn!(name, reason, "globally registered enum does not match this database");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn reload_types(&mut self) -> Result<()> {
        self.registry = TypeRegistry::builtin();
        self.load_global_types().await
    }

    // === Notifications ===

    /// Wait for the next notification, taking queued ones first.
    pub async fn next_notification(&mut self) -> Result<Notification> {
        loop {
            if let Some(notification) = self.notifications.pop_front() {
                return Ok(notification);
            }
            let (type_byte, range) = read_frame(&mut self.stream, &mut self.bufs.read, None).await?;
            self.dispatch_idle(type_byte, range)?;
        }
    }

    /// Consume whatever arrived while idle, without waiting.
    pub fn poll_idle(&mut self) -> Result<()> {
        let eof = loop {
            match self.stream.try_read_buf(self.bufs.read.spare()) {
                Ok(0) => break true,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break false,
                Err(err) => return Err(err.into()),
            }
        };
        // Whatever the server sent before hanging up, usually a FATAL error, comes first.
        while let Some((type_byte, range)) = self.bufs.read.next_frame()? {
            self.dispatch_idle(type_byte, range)?;
        }
        if eof {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        Ok(())
    }

    /// Handle a message that arrived with no command running. The server only
    /// sends an ErrorResponse then when it is about to close the session,
    /// e.g. `57P01` on shutdown or `pg_terminate_backend`.
    fn dispatch_idle(&mut self, type_byte: u8, range: Range<usize>) -> Result<()> {
        if RawMessage::is_async_type(type_byte) {
            return self.dispatch_async(type_byte, range);
        }
        let err = match type_byte {
            msg_type::ERROR_RESPONSE => ErrorResponse::parse(self.payload(range))?.into_error(),
            other => Error::Protocol(format!("unexpected message '{}' while idle", other as char)),
        };
        self.shared.mark_broken(&err);
        Err(err)
    }

    // === COPY ===

    /// Run a COPY statement and wait until the server switches to COPY mode.
    pub async fn start_copy(
        &mut self,
        sql: &str,
        direction: CopyDirection,
        format: FormatCode,
    ) -> Result<(QueryCursor, CopyResponse)> {
        let mut cursor = self.start_simple(sql).await?;
        loop {
            let (type_byte, range) = self.recv().await?;
            let step = cursor.machine.step(type_byte, self.payload(range.clone()))?;
            let actual = match step {
                Step::CopyIn => CopyDirection::In,
                Step::CopyOut => CopyDirection::Out,
                Step::Ready => {
                    self.finish_command(&mut cursor)?;
                    return Err(Error::InvalidUsage(format!(
                        "statement did not start a COPY: {}",
                        sql
                    )));
                }
                _ => continue,
            };
            self.shared.set_state(cursor.machine.phase());
            let response = CopyResponse::parse(self.payload(range))?;
            if actual != direction || response.format != format {
                let state = self.shared.state();
                self.recover_protocol(state).await?;
                return Err(Error::InvalidUsage(format!(
                    "expected a {:?} COPY {:?}, the statement started a {:?} COPY {:?}",
                    format, direction, response.format, actual
                )));
            }
            return Ok((cursor, response));
        }
    }

    /// Rows staged for the next CopyData message.
    pub fn copy_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.bufs.copy_buffer
    }

    /// Encode one COPY field into the staging buffer. On error nothing is staged.
    pub fn stage_copy_value(&mut self, value: &Value, type_name: Option<&str>) -> Result<()> {
        if value.is_null() {
            self.bufs.copy_buffer.extend_from_slice(&(-1_i32).to_be_bytes());
            return Ok(());
        }
        let handler = match type_name {
            Some(name) => self
                .registry
                .get_by_name(name)
                .cloned()
                .ok_or_else(|| Error::InvalidUsage(format!("unknown type {:?}", name)))?,
            None => self.registry.handler_for_value(value)?,
        };
        let buf = &mut self.bufs.copy_buffer;
        let start = buf.len();
        self.registry
            .encode_field(&handler, value, buf)
            .inspect_err(|_| buf.truncate(start))
    }

    /// Send the staged rows as one CopyData message.
    pub async fn flush_copy_data(&mut self) -> Result<()> {
        let BufferSet {
            write_buffer,
            copy_buffer,
            ..
        } = &mut *self.bufs;
        if copy_buffer.is_empty() {
            return Ok(());
        }
        write_buffer.clear();
        write_copy_data(write_buffer, copy_buffer);
        copy_buffer.clear();
        self.flush_writes().await
    }

    /// Send CopyDone and wait for the server's row count.
    pub async fn finish_copy_in(&mut self, cursor: &mut QueryCursor) -> Result<u64> {
        self.flush_copy_data().await?;
        self.bufs.write_buffer.clear();
        write_copy_done(&mut self.bufs.write_buffer);
        self.flush_writes().await?;
        self.drain(cursor).await
    }

    /// Abort a COPY IN. The server discards everything sent so far.
    pub async fn fail_copy_in(&mut self, cursor: &mut QueryCursor, reason: &str) -> Result<()> {
        self.bufs.copy_buffer.clear();
        self.bufs.write_buffer.clear();
        write_copy_fail(&mut self.bufs.write_buffer, reason);
        self.flush_writes().await?;
        match self.drain(cursor).await {
            // 57014: query_canceled, the expected answer to CopyFail
            Err(err) if err.sqlstate() == Some("57014") => Ok(()),
            Err(err) => Err(err),
            Ok(_) => Err(Error::Protocol(
                "server accepted a COPY that was failed by the client".into(),
            )),
        }
    }

    /// Next CopyData payload of a COPY OUT, or None once the command finished.
    pub async fn next_copy_data(&mut self, cursor: &mut QueryCursor) -> Result<Option<Range<usize>>> {
        while !cursor.done {
            let (type_byte, range) = self.recv().await?;
            let step = cursor.machine.step(type_byte, self.payload(range.clone()))?;
            match step {
                Step::CopyData => return Ok(Some(range)),
                Step::Complete => {
                    let complete = CommandComplete::parse(self.payload(range))?;
                    cursor.rows_affected += complete.rows_affected().unwrap_or(0);
                    self.shared.set_state(cursor.machine.phase());
                }
                Step::Ready => self.finish_command(cursor)?,
                _ => self.shared.set_state(cursor.machine.phase()),
            }
        }
        Ok(None)
    }

    // === Shutdown ===

    /// Send Terminate and close the socket. Errors are irrelevant at this point.
    pub async fn terminate(&mut self) {
        self.terminated = true;
        self.bufs.write_buffer.clear();
        write_terminate(&mut self.bufs.write_buffer);
        if let Err(err) = self.flush_writes().await {
            tracing::debug!(error = %err, "terminate failed");
        }
        let _ = self.stream.shutdown().await;
    }

    /// Terminate without a runtime, as far as the socket accepts it.
    pub fn terminate_nonblocking(&mut self) {
        if std::mem::replace(&mut self.terminated, true) {
            return;
        }
        let mut buf = Vec::with_capacity(5);
        write_terminate(&mut buf);
        let _ = self.stream.try_write(&buf);
    }
}

/// Exclusive access to a session for the duration of one operation.
pub(crate) struct SessionGuard {
    // Field order matters: the claim is released before the mutex, so
    // whoever locks the session next finds the connector unclaimed.
    _claim: Claim,
    session: OwnedMutexGuard<Session>,
}

impl SessionGuard {
    pub fn new(session: OwnedMutexGuard<Session>, claim: Claim) -> Self {
        Self {
            _claim: claim,
            session,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.session.shared.close_requested() {
            self.session.terminate_nonblocking();
        }
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}
