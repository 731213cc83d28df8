//! Keyed connector pool.
//!
//! Every open connector holds one semaphore permit for its whole life, idle
//! or checked out, so a pool never has more than `max_pool_size` connectors.
//! Idle connectors are kept oldest first; acquisition takes the most recently
//! used one and pruning starts at the other end.

mod key;

pub use key::PoolKey;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::state::ConnectorState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

static POOLS: LazyLock<Mutex<HashMap<PoolKey, Pool>>> = LazyLock::new(Default::default);

/// Open a connector: from the process-wide pool for these options, or a
/// fresh one when `opts.pooling` is off.
pub async fn connect(opts: Opts) -> Result<Connection> {
    if !opts.pooling {
        return Connector::open(opts).await.map(Connection::Direct);
    }
    opts.validate()?;
    let pool = {
        let mut pools = POOLS.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(opts.pool_key())
            .or_insert_with_key(|key| Pool::with_key(opts, key.clone()))
            .clone()
    };
    pool.acquire().await.map(Connection::Pooled)
}

/// Close the idle connectors of every process-wide pool.
pub async fn clear_all_pools() {
    let pools: Vec<Pool> = POOLS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
        .cloned()
        .collect();
    for pool in pools {
        pool.clear().await;
    }
}

/// Connector returned by [`connect`].
#[derive(Debug)]
pub enum Connection {
    Pooled(PooledConnector),
    Direct(Connector),
}

impl Deref for Connection {
    type Target = Connector;

    fn deref(&self) -> &Connector {
        match self {
            Connection::Pooled(pooled) => &**pooled,
            Connection::Direct(connector) => connector,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub total: usize,
}

/// Number of expired idle connectors to prune in one sweep.
///
/// Half the excess over the minimum, rounded up, so a pool shrinks gradually
/// instead of reconnecting everything at once when load returns.
pub(crate) fn prune_count(total: usize, min: usize, expired: usize) -> usize {
    let excess = total.saturating_sub(min);
    expired.min(excess.div_ceil(2))
}

struct PoolEntry {
    connector: Connector,
    permit: OwnedSemaphorePermit,
    idle_since: Instant,
}

/// Pool of connectors sharing one set of options.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    opts: Opts,
    key: PoolKey,
    idle: Mutex<VecDeque<PoolEntry>>,
    permits: Arc<Semaphore>,
    /// Signalled whenever a connector returns to the idle set or a permit is freed
    released: Notify,
    /// Bumped by `clear()`; connectors checked out before are not taken back
    generation: AtomicU64,
    sweeper: OnceLock<AbortHandle>,
}

impl Pool {
    pub fn new(opts: Opts) -> Result<Self> {
        opts.validate()?;
        let key = opts.pool_key();
        Ok(Self::with_key(opts, key))
    }

    fn with_key(opts: Opts, key: PoolKey) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(opts.max_pool_size)),
                opts,
                key,
                idle: Mutex::new(VecDeque::new()),
                released: Notify::new(),
                generation: AtomicU64::new(0),
                sweeper: OnceLock::new(),
            }),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.inner.key
    }

    pub fn opts(&self) -> &Opts {
        &self.inner.opts
    }

    /// Check out a connector, opening one if none is idle and the pool has room.
    ///
    /// Waits at most `connect_timeout` (opening included) before failing with
    /// [`Error::Timeout`].
    pub async fn acquire(&self) -> Result<PooledConnector> {
        self.inner.start_sweeper();
        let wait = self.inner.opts.connect_timeout;
        match tokio::time::timeout(wait, self.inner.checkout()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "no connector available in pool {} within {:?}",
                self.inner.key, wait
            ))),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle().len();
        let total = self.inner.total();
        PoolStats {
            idle,
            busy: total.saturating_sub(idle),
            total,
        }
    }

    /// Close every idle connector. Connectors checked out now are closed
    /// when they come back instead of rejoining the pool.
    pub async fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let entries: Vec<PoolEntry> = self.inner.idle().drain(..).collect();
        tracing::debug!(pool = %self.inner.key, closed = entries.len(), "pool cleared");
        for entry in entries {
            self.inner.close_entry(entry).await;
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("key", &self.inner.key)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<PoolEntry>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn total(&self) -> usize {
        self.opts.max_pool_size - self.permits.available_permits()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn start_sweeper(self: &Arc<Self>) {
        self.sweeper.get_or_init(|| {
            let pool = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    pool.sweep().await;
                }
            })
            .abort_handle()
        });
    }

    async fn checkout(self: &Arc<Self>) -> Result<PooledConnector> {
        loop {
            // Registered before looking, so a release in between is not missed.
            let mut released = pin!(self.released.notified());
            released.as_mut().enable();

            if let Some(entry) = self.pop_idle() {
                tracing::debug!(
                    pool = %self.key,
                    pid = entry.connector.process_id(),
                    "reusing pooled connector"
                );
                return Ok(PooledConnector::new(self, entry.connector, entry.permit));
            }

            if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
                let connector = match Connector::open(self.opts.clone()).await {
                    Ok(connector) => connector,
                    Err(err) => {
                        drop(permit);
                        self.released.notify_one();
                        return Err(err);
                    }
                };
                tracing::debug!(
                    pool = %self.key,
                    pid = connector.process_id(),
                    total = self.total(),
                    "opened pooled connector"
                );
                return Ok(PooledConnector::new(self, connector, permit));
            }

            released.await;
        }
    }

    /// Most recently used healthy idle connector. Unhealthy ones met on the
    /// way are dropped, freeing their permits.
    fn pop_idle(&self) -> Option<PoolEntry> {
        let mut idle = self.idle();
        while let Some(entry) = idle.pop_back() {
            if entry.connector.is_reusable() {
                return Some(entry);
            }
            tracing::debug!(pool = %self.key, "discarding unusable idle connector");
        }
        None
    }

    fn push_idle(&self, connector: Connector, permit: OwnedSemaphorePermit) {
        self.idle().push_back(PoolEntry {
            connector,
            permit,
            idle_since: Instant::now(),
        });
        self.released.notify_one();
    }

    fn discard(&self, connector: Connector, permit: OwnedSemaphorePermit, reason: &str) {
        tracing::debug!(pool = %self.key, pid = connector.process_id(), reason, "discarding connector");
        drop(connector);
        drop(permit);
        self.released.notify_one();
    }

    async fn close_entry(&self, entry: PoolEntry) {
        if let Err(err) = entry.connector.close().await {
            tracing::debug!(pool = %self.key, error = %err, "closing idle connector failed");
        }
        drop(entry);
        self.released.notify_one();
    }

    fn release(self: &Arc<Self>, connector: Connector, permit: OwnedSemaphorePermit, generation: u64) {
        if !connector.is_held() {
            if generation != self.generation() {
                return self.discard(connector, permit, "pool was cleared");
            }
            if connector.is_reusable() {
                return self.push_idle(connector, permit);
            }
            if matches!(connector.state(), ConnectorState::Broken | ConnectorState::Closed) {
                return self.discard(connector, permit, "connector is broken");
            }
        }

        // Unfinished work: a result set or COPY still open, or a transaction
        // to roll back. The permit stays taken while a stream that outlived
        // the handle keeps the socket open.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return self.discard(connector, permit, "no runtime to reset on");
        };
        let pool = Arc::clone(self);
        runtime.spawn(async move {
            connector.wait_released().await;
            if generation != pool.generation() {
                return pool.discard(connector, permit, "pool was cleared");
            }
            match connector.reset().await {
                Ok(()) if connector.is_reusable() => pool.push_idle(connector, permit),
                Ok(()) => pool.discard(connector, permit, "connector still busy after reset"),
                Err(err) => {
                    tracing::debug!(pool = %pool.key, error = %err, "resetting returned connector failed");
                    pool.discard(connector, permit, "reset failed");
                }
            }
        });
    }

    async fn sweep(&self) {
        let generation = self.generation();
        let pruned: Vec<PoolEntry> = {
            let mut idle = self.idle();
            let before = idle.len();
            idle.retain(|entry| entry.connector.is_reusable());
            let dropped = before - idle.len();
            if dropped > 0 {
                tracing::debug!(pool = %self.key, dropped, "dropped unusable idle connectors");
                for _ in 0..dropped {
                    self.released.notify_one();
                }
            }

            let lifetime = self.opts.connection_lifetime;
            let expired = idle
                .iter()
                .take_while(|entry| entry.idle_since.elapsed() >= lifetime)
                .count();
            let prune = prune_count(self.total(), self.opts.min_pool_size, expired);
            idle.drain(..prune).collect()
        };
        if !pruned.is_empty() {
            tracing::debug!(pool = %self.key, pruned = pruned.len(), "pruning expired idle connectors");
        }
        for entry in pruned {
            self.close_entry(entry).await;
        }

        let missing = self.opts.min_pool_size.saturating_sub(self.total());
        for _ in 0..missing {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            match Connector::open(self.opts.clone()).await {
                Ok(connector) if generation == self.generation() => {
                    tracing::debug!(pool = %self.key, pid = connector.process_id(), "opened connector to reach min_pool_size");
                    self.push_idle(connector, permit);
                }
                Ok(connector) => self.discard(connector, permit, "pool was cleared"),
                Err(err) => {
                    tracing::warn!(pool = %self.key, error = %err, "opening connector for min_pool_size failed");
                    drop(permit);
                    self.released.notify_one();
                    break;
                }
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get() {
            sweeper.abort();
        }
    }
}

/// A connector checked out of a [`Pool`]. Dropping it hands the connector back.
pub struct PooledConnector {
    checkout: ManuallyDrop<Checkout>,
    generation: u64,
    pool: Arc<PoolInner>,
}

struct Checkout {
    connector: Connector,
    permit: OwnedSemaphorePermit,
}

impl PooledConnector {
    fn new(pool: &Arc<PoolInner>, connector: Connector, permit: OwnedSemaphorePermit) -> Self {
        Self {
            checkout: ManuallyDrop::new(Checkout { connector, permit }),
            generation: pool.generation(),
            pool: Arc::clone(pool),
        }
    }
}

impl Deref for PooledConnector {
    type Target = Connector;

    fn deref(&self) -> &Connector {
        &self.checkout.connector
    }
}

impl fmt::Debug for PooledConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnector")
            .field("pool", &self.pool.key)
            .field("connector", &self.checkout.connector)
            .finish()
    }
}

impl Drop for PooledConnector {
    fn drop(&mut self) {
        // SAFETY: checkout is never accessed after this
        let Checkout { connector, permit } = unsafe { ManuallyDrop::take(&mut self.checkout) };
        self.pool.release(connector, permit, self.generation);
    }
}
