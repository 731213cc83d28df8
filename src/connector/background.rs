//! Idle-time tasks: keepalive pings and continuous notification polling.
//!
//! Both only touch the session while the connector is Ready and unclaimed,
//! and only through `try_lock`, so they never interleave with a caller's
//! command.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::state::ConnectorState;

use super::session::Session;
use super::shared::Shared;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Idle {
    Session(OwnedMutexGuard<Session>),
    Busy,
    Gone,
}

fn idle_session(shared: &Shared, session: &Weak<Mutex<Session>>) -> Idle {
    match shared.state() {
        ConnectorState::Broken | ConnectorState::Closed => return Idle::Gone,
        ConnectorState::Ready if !shared.is_claimed() => {}
        _ => return Idle::Busy,
    }
    let Some(session) = session.upgrade() else {
        return Idle::Gone;
    };
    match session.try_lock_owned() {
        // Re-check under the lock: a caller may have claimed in between.
        Ok(guard) if shared.state() == ConnectorState::Ready && !shared.is_claimed() => {
            Idle::Session(guard)
        }
        _ => Idle::Busy,
    }
}

pub(crate) fn spawn_keepalive(
    shared: Arc<Shared>,
    session: Weak<Mutex<Session>>,
    period: Duration,
) -> AbortHandle {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut guard = match idle_session(&shared, &session) {
                Idle::Session(guard) => guard,
                Idle::Busy => continue,
                Idle::Gone => break,
            };
            match guard.ping().await {
                Ok(()) => tracing::trace!("keepalive ok"),
                Err(err) => {
                    tracing::warn!(error = %err, "keepalive ping failed");
                    shared.mark_broken(&err);
                    break;
                }
            }
        }
    })
    .abort_handle()
}

pub(crate) fn spawn_poller(shared: Arc<Shared>, session: Weak<Mutex<Session>>) -> AbortHandle {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut guard = match idle_session(&shared, &session) {
                Idle::Session(guard) => guard,
                Idle::Busy => continue,
                Idle::Gone => break,
            };
            if let Err(err) = guard.poll_idle() {
                tracing::warn!(error = %err, "idle connector failed");
                shared.mark_broken(&err);
                break;
            }
        }
    })
    .abort_handle()
}
