//! Connector state visible without holding the session.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::events::{Listeners, Notice, Notification, StateChange};
use crate::protocol::types::TransactionStatus;
use crate::state::ConnectorState;

use super::params::BackendParams;

pub(crate) struct Shared {
    state: AtomicU8,
    claimed: AtomicBool,
    /// Set by `close()` while an operation still holds the session
    close_requested: AtomicBool,
    rollback_pending: AtomicBool,
    transaction_status: AtomicU8,
    params: RwLock<BackendParams>,
    pub state_listeners: Listeners<StateChange>,
    pub notice_listeners: Listeners<Notice>,
    pub notification_listeners: Listeners<Notification>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectorState::Closed as u8),
            claimed: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            rollback_pending: AtomicBool::new(false),
            transaction_status: AtomicU8::new(TransactionStatus::Idle as u8),
            params: RwLock::new(BackendParams::default()),
            state_listeners: Listeners::default(),
            notice_listeners: Listeners::default(),
            notification_listeners: Listeners::default(),
        }
    }

    pub fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`. Broken only ever gives way to Closed.
    pub fn set_state(&self, next: ConnectorState) {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = ConnectorState::from_u8(current);
                if current == ConnectorState::Broken && next != ConnectorState::Closed {
                    None
                } else {
                    Some(next as u8)
                }
            });
        let Ok(previous) = result else {
            return;
        };
        let previous = ConnectorState::from_u8(previous);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            tracing::warn!(?previous, ?next, "unexpected connector state transition");
        }
        tracing::trace!(?previous, ?next, "connector state");

        let (before, after) = (
            previous.connection_state().base(),
            next.connection_state().base(),
        );
        if before != after {
            self.state_listeners.emit(&StateChange {
                previous: before,
                current: after,
            });
        }
    }

    pub fn mark_broken(&self, cause: &Error) {
        if self.state() != ConnectorState::Broken {
            tracing::warn!(error = %cause, "connector is broken");
            self.set_state(ConnectorState::Broken);
        }
    }

    /// Fail fast unless the connector can run a command.
    pub fn check_usable(&self) -> Result<()> {
        match self.state() {
            ConnectorState::Broken => Err(Error::ConnectionBroken),
            ConnectorState::Closed => Err(Error::InvalidUsage("connector is closed".into())),
            ConnectorState::Connecting | ConnectorState::Authenticating => Err(
                Error::InvalidUsage("connector has not finished opening".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Take exclusive use of the connector, or fail with [`Error::Busy`].
    pub fn try_claim(self: &Arc<Self>) -> Result<Claim> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                Error::Busy("another operation is in progress on this connector".into())
            })?;
        Ok(Claim(Arc::clone(self)))
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Close from outside the holder of the session. Its next read or write
    /// fails, and Terminate goes out when it lets go.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.set_state(ConnectorState::Closed);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        TransactionStatus::from_byte(self.transaction_status.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    pub fn set_transaction_status(&self, status: TransactionStatus) {
        self.transaction_status.store(status as u8, Ordering::Release);
    }

    pub fn schedule_rollback(&self) {
        self.rollback_pending.store(true, Ordering::Release);
    }

    pub fn rollback_pending(&self) -> bool {
        self.rollback_pending.load(Ordering::Acquire)
    }

    pub fn take_rollback_pending(&self) -> bool {
        self.rollback_pending.swap(false, Ordering::AcqRel)
    }

    pub fn params(&self) -> BackendParams {
        self.params.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update_params(&self, f: impl FnOnce(&mut BackendParams)) {
        f(&mut self.params.write().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Exclusive use of a connector; released on drop.
pub(crate) struct Claim(Arc<Shared>);

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim").finish_non_exhaustive()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.0.claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState;
    use std::sync::Mutex;

    #[test]
    fn test_claim_is_exclusive() {
        let shared = Arc::new(Shared::new());
        let claim = shared.try_claim().unwrap();
        assert!(shared.is_claimed());
        assert!(shared.try_claim().unwrap_err().is_busy());
        drop(claim);
        assert!(!shared.is_claimed());
        shared.try_claim().unwrap();
    }

    #[test]
    fn test_state_change_fires_on_base_change_only() {
        let shared = Shared::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        shared.state_listeners.add(move |change: &StateChange| {
            sink.lock().unwrap().push((change.previous, change.current));
        });

        shared.set_state(ConnectorState::Connecting);
        shared.set_state(ConnectorState::Authenticating);
        shared.set_state(ConnectorState::Ready);
        shared.set_state(ConnectorState::Executing);
        shared.set_state(ConnectorState::Fetching);
        shared.set_state(ConnectorState::Ready);
        shared.set_state(ConnectorState::Broken);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ConnectionState::CLOSED, ConnectionState::CONNECTING),
                (ConnectionState::CONNECTING, ConnectionState::OPEN),
                (ConnectionState::OPEN, ConnectionState::BROKEN),
            ]
        );
    }

    #[test]
    fn test_broken_is_terminal() {
        let shared = Shared::new();
        shared.set_state(ConnectorState::Broken);
        shared.set_state(ConnectorState::Ready);
        assert_eq!(shared.state(), ConnectorState::Broken);
        assert!(matches!(shared.check_usable(), Err(Error::ConnectionBroken)));
        shared.set_state(ConnectorState::Closed);
        assert_eq!(shared.state(), ConnectorState::Closed);
    }

    #[test]
    fn test_close_while_claimed() {
        let shared = Arc::new(Shared::new());
        shared.set_state(ConnectorState::Fetching);
        let claim = shared.try_claim().unwrap();
        shared.request_close();
        assert!(shared.close_requested());
        assert_eq!(shared.state(), ConnectorState::Closed);
        drop(claim);
        assert!(matches!(shared.check_usable(), Err(Error::InvalidUsage(_))));
    }

    #[test]
    fn test_rollback_flag() {
        let shared = Shared::new();
        assert!(!shared.take_rollback_pending());
        shared.schedule_rollback();
        assert!(shared.rollback_pending());
        assert!(shared.take_rollback_pending());
        assert!(!shared.rollback_pending());
    }
}
