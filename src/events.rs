//! Events surfaced to callers: state changes, notices and notifications.
//!
//! Listeners run synchronously on the task that read the triggering message,
//! in wire order relative to the rows around them.

use std::sync::{Arc, RwLock};

use crate::error::ErrorFields;
use crate::state::ConnectionState;

/// Server advisory message (NoticeResponse).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub fields: ErrorFields,
}

impl Notice {
    pub fn severity(&self) -> Option<&str> {
        self.fields.severity()
    }

    pub fn message(&self) -> &str {
        self.fields.message.as_deref().unwrap_or("")
    }
}

/// LISTEN/NOTIFY payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Process id of the notifying backend
    pub process_id: u32,
    pub channel: String,
    /// Empty when NOTIFY was sent without a payload
    pub payload: String,
}

/// Transition between closed, connecting, open and broken.
///
/// Moves between executing and fetching do not fire this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) struct Listeners<T> {
    list: RwLock<Vec<Listener<T>>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }
}

impl<T> Listeners<T> {
    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.list
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    pub fn is_empty(&self) -> bool {
        self.list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Call every listener. The lock is not held while they run, so a
    /// listener may register further listeners.
    pub fn emit(&self, event: &T) {
        let listeners = self.list.read().unwrap_or_else(|e| e.into_inner()).clone();
        for listener in listeners {
            listener(event);
        }
    }
}
