//! One protocol session with a PostgreSQL backend.
//!
//! A [`Connector`] is used by one caller at a time. Every operation claims it
//! for its duration; a second operation started meanwhile (including while a
//! [`RowStream`] or COPY wrapper is alive) fails immediately with
//! [`Error::Busy`] instead of queueing. [`Connector::close`] is the exception:
//! it cuts off a live stream rather than waiting for it.
//!
//! Operations are cancel safe in the tokio sense: dropping a future halfway
//! leaves the connector in a state the next operation recovers from, or marks
//! it broken when a message was cut in half.

mod background;
mod params;
mod rows;
mod session;
mod shared;
mod statement;
mod stream;
mod transaction;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::copy::{BinaryExporter, BinaryImporter, RawCopy, TextExporter, TextImporter};
use crate::error::{Error, Result};
use crate::events::{Notice, Notification, StateChange};
use crate::opts::Opts;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::types::{FormatCode, TransactionStatus};
use crate::row::Row;
use crate::state::{ConnectionState, ConnectorState};
use crate::types::{FromValue, PgEnum, Value};

pub use params::BackendParams;
pub use rows::RowStream;
pub use session::CopyDirection;
pub use statement::Statement;
pub use transaction::{IsolationLevel, Transaction};

pub(crate) use session::{QueryCursor, SessionGuard};

use session::{Session, send_cancel};
use shared::Shared;

/// An authenticated session with the server.
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    session: Arc<Mutex<Session>>,
    opts: Arc<Opts>,
    backend_key: Option<BackendKeyData>,
    tasks: Vec<AbortHandle>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if self.shared.state() == ConnectorState::Ready {
            if let Ok(mut session) = self.session.try_lock() {
                session.terminate_nonblocking();
            }
        }
        self.shared.set_state(ConnectorState::Closed);
    }
}

impl Connector {
    /// Connect and authenticate.
    ///
    /// The whole handshake, including resolving globally registered enums,
    /// is bounded by `connect_timeout`.
    pub async fn open(opts: Opts) -> Result<Self> {
        opts.validate()?;
        let opts = Arc::new(opts);
        let shared = Arc::new(Shared::new());
        shared.set_state(ConnectorState::Connecting);
        tracing::debug!(endpoint = %opts.endpoint(), user = %opts.user, "opening connector");

        let opened = tokio::time::timeout(
            opts.connect_timeout,
            Self::handshake(Arc::clone(&opts), Arc::clone(&shared)),
        )
        .await;
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                shared.set_state(ConnectorState::Closed);
                return Err(err);
            }
            Err(_) => {
                shared.set_state(ConnectorState::Closed);
                return Err(Error::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    opts.endpoint(),
                    opts.connect_timeout
                )));
            }
        };

        let backend_key = session.backend_key();
        let continuous = opts.continuous_processing && session.supports_nonblocking_read();
        let session = Arc::new(Mutex::new(session));

        let mut tasks = Vec::new();
        if let Some(period) = opts.keepalive {
            tasks.push(background::spawn_keepalive(
                Arc::clone(&shared),
                Arc::downgrade(&session),
                period,
            ));
        }
        if continuous {
            tasks.push(background::spawn_poller(
                Arc::clone(&shared),
                Arc::downgrade(&session),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                session,
                opts,
                backend_key,
                tasks,
            }),
        })
    }

    async fn handshake(opts: Arc<Opts>, shared: Arc<Shared>) -> Result<Session> {
        let mut session = Session::connect(opts, Arc::clone(&shared)).await?;
        shared.set_state(ConnectorState::Ready);
        if let Err(err) = session.load_global_types().await {
            session.terminate().await;
            return Err(err);
        }
        Ok(session)
    }

    /// Claim the connector and recover it from any abandoned operation.
    pub(crate) async fn session(&self) -> Result<SessionGuard> {
        let shared = &self.inner.shared;
        shared.check_usable()?;
        let claim = shared.try_claim()?;
        let session = Arc::clone(&self.inner.session).lock_owned().await;
        let mut guard = SessionGuard::new(session, claim);
        guard.ensure_ready().await?;
        Ok(guard)
    }

    pub fn opts(&self) -> &Opts {
        &self.inner.opts
    }

    /// Protocol state.
    pub fn state(&self) -> ConnectorState {
        self.inner.shared.state()
    }

    /// Caller-facing state flags, e.g. `Open | Fetching`.
    pub fn connection_state(&self) -> ConnectionState {
        self.state().connection_state()
    }

    pub fn is_broken(&self) -> bool {
        self.state() == ConnectorState::Broken
    }

    /// Backend process id, as used by `pg_terminate_backend` and cancellation.
    pub fn process_id(&self) -> u32 {
        self.inner.backend_key.map_or(0, |k| k.process_id())
    }

    pub fn backend_params(&self) -> BackendParams {
        self.inner.shared.params()
    }

    /// Transaction status from the latest ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.inner.shared.transaction_status()
    }

    pub(crate) fn schedule_rollback(&self) {
        self.inner.shared.schedule_rollback();
    }

    /// Ready, unclaimed and outside any transaction, so another caller can
    /// take it over as is.
    pub(crate) fn is_reusable(&self) -> bool {
        let shared = &self.inner.shared;
        shared.state() == ConnectorState::Ready
            && !shared.is_claimed()
            && !shared.rollback_pending()
            && shared.transaction_status() == TransactionStatus::Idle
    }

    /// Whether a stream, COPY wrapper or command still holds the session.
    pub(crate) fn is_held(&self) -> bool {
        self.inner.shared.is_claimed()
    }

    /// Wait until nothing holds the session, which includes a [`RowStream`]
    /// or COPY wrapper that outlived its connector handle.
    pub(crate) async fn wait_released(&self) {
        drop(Arc::clone(&self.inner.session).lock_owned().await);
    }

    /// Finish abandoned work and roll back an open transaction.
    pub(crate) async fn reset(&self) -> Result<()> {
        if self.transaction_status() != TransactionStatus::Idle {
            self.schedule_rollback();
        }
        self.session().await.map(drop)
    }

    pub fn on_state_change(&self, listener: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.inner.shared.state_listeners.add(listener);
    }

    pub fn on_notice(&self, listener: impl Fn(&Notice) + Send + Sync + 'static) {
        self.inner.shared.notice_listeners.add(listener);
    }

    pub fn on_notification(&self, listener: impl Fn(&Notification) + Send + Sync + 'static) {
        self.inner.shared.notification_listeners.add(listener);
    }

    // === Queries ===

    /// Run a statement and return the number of affected rows.
    ///
    /// Without parameters the simple protocol is used, so `sql` may hold
    /// several statements; their counts are summed.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut session = self.session().await?;
        let result = if params.is_empty() {
            session.execute_simple(sql).await
        } else {
            match session.query(sql, params).await {
                Ok(mut cursor) => session.drain(&mut cursor).await,
                Err(err) => Err(err),
            }
        };
        session.settle(result).await
    }

    /// Run `sql` through the simple protocol. Columns arrive in text format.
    pub async fn simple_query(&self, sql: &str) -> Result<RowStream> {
        let mut session = self.session().await?;
        let result = session.start_simple(sql).await;
        let cursor = session.settle(result).await?;
        Ok(RowStream::new(session, cursor))
    }

    /// Run a parameterized statement. Parameters are checked against the
    /// types the server resolves for them before anything is bound.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<RowStream> {
        let mut session = self.session().await?;
        let result = session.query(sql, params).await;
        let cursor = session.settle(result).await?;
        Ok(RowStream::new(session, cursor))
    }

    pub async fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.query(sql, params).await?.collect().await
    }

    /// First row, or `None` when the query returned nothing. Later rows are discarded.
    pub async fn query_opt(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let mut rows = self.query(sql, params).await?;
        let first = rows.next().await?;
        rows.close().await?;
        Ok(first)
    }

    /// First row; no rows is an error.
    pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Row> {
        self.query_opt(sql, params)
            .await?
            .ok_or_else(|| Error::InvalidUsage("query returned no rows".into()))
    }

    /// First column of the first row.
    pub async fn query_scalar<T: FromValue>(&self, sql: &str, params: &[Value]) -> Result<T> {
        self.query_one(sql, params).await?.get(0)
    }

    /// Parse a named statement for repeated execution.
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let mut session = self.session().await?;
        let name = session.next_statement_name();
        let result = session.prepare(&name, sql, &[]).await;
        session.settle(result).await
    }

    pub async fn query_prepared(&self, statement: &Statement, params: &[Value]) -> Result<RowStream> {
        self.check_statement(statement)?;
        let mut session = self.session().await?;
        let result = session.bind_execute(statement, params).await;
        let cursor = session.settle(result).await?;
        Ok(RowStream::new(session, cursor))
    }

    pub async fn execute_prepared(&self, statement: &Statement, params: &[Value]) -> Result<u64> {
        self.query_prepared(statement, params).await?.close().await
    }

    /// Release a named statement on the server.
    pub async fn close_statement(&self, statement: Statement) -> Result<()> {
        self.check_statement(&statement)?;
        let mut session = self.session().await?;
        let result = session.close_statement(&statement.name).await;
        session.settle(result).await
    }

    fn check_statement(&self, statement: &Statement) -> Result<()> {
        if statement.process_id != self.process_id() {
            return Err(Error::InvalidUsage(format!(
                "statement {} was prepared on backend {}, this connector is {}",
                statement.name,
                statement.process_id,
                self.process_id()
            )));
        }
        Ok(())
    }

    // === Transactions ===

    /// `BEGIN` with the server's default isolation level.
    pub async fn begin(&self) -> Result<Transaction<'_>> {
        self.start_transaction("BEGIN").await
    }

    pub async fn begin_with(&self, isolation: IsolationLevel) -> Result<Transaction<'_>> {
        self.start_transaction(&format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql()))
            .await
    }

    async fn start_transaction(&self, sql: &str) -> Result<Transaction<'_>> {
        let mut session = self.session().await?;
        if self.transaction_status().in_transaction() {
            return Err(Error::InvalidUsage(
                "a transaction is already in progress on this connector".into(),
            ));
        }
        let result = session.execute_simple(sql).await;
        session.settle(result).await?;
        Ok(Transaction::new(self))
    }

    // === Maintenance ===

    /// Round trip with an empty statement.
    pub async fn ping(&self) -> Result<()> {
        let mut session = self.session().await?;
        let result = session.ping().await;
        session.settle(result).await
    }

    /// Ask the server to cancel the running command.
    ///
    /// Does not claim the connector; it is meant to be called while another
    /// task waits on a long statement, which then fails with SQLSTATE 57014.
    pub async fn cancel(&self) -> Result<()> {
        let key = self
            .inner
            .backend_key
            .ok_or_else(|| Error::Unsupported("server sent no cancellation key".into()))?;
        send_cancel(&self.inner.opts, key).await
    }

    /// Wait for a LISTEN/NOTIFY payload. `None` after `timeout` passes quietly.
    ///
    /// Notifications that arrived during earlier commands are returned first.
    pub async fn wait_for_notification(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Notification>> {
        let mut session = self.session().await?;
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, session.next_notification()).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            },
            None => session.next_notification().await.map(Some),
        };
        session.settle(result).await
    }

    /// Register a server enum on this connector only.
    pub async fn register_enum(&self, name: &str, labels: &[&str]) -> Result<()> {
        let labels = labels.iter().map(|l| l.to_string()).collect();
        let mut session = self.session().await?;
        let result = session.register_enum(name, labels).await;
        session.settle(result).await
    }

    pub async fn register_pg_enum<T: PgEnum>(&self) -> Result<()> {
        self.register_enum(T::TYPE_NAME, T::LABELS).await
    }

    /// Reseed the type registry from the built-ins and the global registrations.
    pub async fn reload_types(&self) -> Result<()> {
        let mut session = self.session().await?;
        let result = session.reload_types().await;
        session.settle(result).await
    }

    /// Terminate the session. Closing a broken connector only records it as closed.
    ///
    /// A [`RowStream`] or COPY wrapper still holding the connector is cut
    /// off: its next call fails with [`Error::InvalidUsage`], and Terminate
    /// is sent when it is dropped.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.inner.shared;
        if matches!(shared.state(), ConnectorState::Broken | ConnectorState::Closed) {
            self.stop_tasks();
            shared.set_state(ConnectorState::Closed);
            return Ok(());
        }
        self.stop_tasks();
        let Ok(claim) = shared.try_claim() else {
            tracing::debug!(pid = self.process_id(), "closing connector under a live operation");
            shared.request_close();
            return Ok(());
        };
        let mut session = Arc::clone(&self.inner.session).lock_owned().await;
        session.terminate().await;
        drop(claim);
        shared.set_state(ConnectorState::Closed);
        tracing::debug!(pid = self.process_id(), "connector closed");
        Ok(())
    }

    fn stop_tasks(&self) {
        for task in &self.inner.tasks {
            task.abort();
        }
    }

    // === COPY ===

    async fn start_copy(
        &self,
        sql: &str,
        direction: CopyDirection,
        format: FormatCode,
    ) -> Result<(SessionGuard, QueryCursor, usize)> {
        let mut session = self.session().await?;
        let result = session.start_copy(sql, direction, format).await;
        let (cursor, response) = session.settle(result).await?;
        Ok((session, cursor, response.num_columns()))
    }

    /// `COPY ... FROM STDIN (FORMAT BINARY)`
    pub async fn begin_binary_import(&self, sql: &str) -> Result<BinaryImporter> {
        let (session, cursor, columns) =
            self.start_copy(sql, CopyDirection::In, FormatCode::Binary).await?;
        Ok(BinaryImporter::new(session, cursor, columns))
    }

    /// `COPY ... TO STDOUT (FORMAT BINARY)`
    pub async fn begin_binary_export(&self, sql: &str) -> Result<BinaryExporter> {
        let (session, cursor, columns) =
            self.start_copy(sql, CopyDirection::Out, FormatCode::Binary).await?;
        Ok(BinaryExporter::new(session, cursor, columns))
    }

    /// `COPY ... FROM STDIN` in text or CSV format.
    pub async fn begin_text_import(&self, sql: &str) -> Result<TextImporter> {
        let (session, cursor, _) = self.start_copy(sql, CopyDirection::In, FormatCode::Text).await?;
        Ok(TextImporter::new(session, cursor))
    }

    /// `COPY ... TO STDOUT` in text or CSV format.
    pub async fn begin_text_export(&self, sql: &str) -> Result<TextExporter> {
        let (session, cursor, _) =
            self.start_copy(sql, CopyDirection::Out, FormatCode::Text).await?;
        Ok(TextExporter::new(session, cursor))
    }

    /// Binary COPY in either direction, passing bytes through untouched.
    pub async fn begin_raw_binary_copy(&self, sql: &str, direction: CopyDirection) -> Result<RawCopy> {
        let (session, cursor, _) = self.start_copy(sql, direction, FormatCode::Binary).await?;
        Ok(RawCopy::new(session, cursor, direction))
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("endpoint", &self.inner.opts.endpoint())
            .field("process_id", &self.process_id())
            .field("state", &self.state())
            .finish()
    }
}
