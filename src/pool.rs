//! Fixed-size pool of node connections with exclusive leasing.
//!
//! The pool behaves like a semaphore whose capacity is the node count.
//! [`NodePool::acquire`] waits for a permit, then takes connections from
//! the front of an idle queue. A Dead connection goes straight back to the
//! tail, so callers only ever receive connections believed Alive. When the
//! whole cluster is Dead the waiter backs off (bounded by the probe
//! interval) and is woken early by a release or a revival.
//!
//! A [`Lease`] returns its connection when dropped, which also covers
//! cancelled and panicking callers.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::connection::Connection;
use crate::errors::{Result, RiakError};
use crate::metrics;
use crate::stats::StatsSnapshot;

/// Capacity of the pool event channel.
const EVENT_CAPACITY: usize = 64;

/// Floor for the probe interval and the acquire backoff.
pub(crate) const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables for a [`NodePool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Interval between health sweeps; also the cap on acquire backoff.
    pub ping_rate: Duration,
    /// Per-request timeout applied by every connection.
    pub request_timeout: Duration,
    /// First backoff step while every idle connection is Dead.
    pub acquire_backoff: Duration,
}

impl PoolOptions {
    /// Raise zero durations to [`MIN_INTERVAL`] so waits always make progress.
    fn clamped(mut self) -> Self {
        self.ping_rate = self.ping_rate.max(MIN_INTERVAL);
        self.acquire_backoff = self.acquire_backoff.max(MIN_INTERVAL);
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            ping_rate: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            acquire_backoff: Duration::from_millis(50),
        }
    }
}

/// Liveness changes observed by the pool or its monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    NodeDown { address: String },
    NodeRevived { address: String },
    ClusterUnreachable { nodes: usize },
}

/// Point-in-time view of one pooled node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub address: String,
    pub alive: bool,
    pub leased: bool,
    pub stats: StatsSnapshot,
}

struct PoolInner {
    connections: Vec<Arc<Connection>>,
    leased: Vec<AtomicBool>,
    /// One permit per entry in `idle`.
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<usize>>,
    /// Woken on every release and revival.
    wake: Notify,
    events: broadcast::Sender<PoolEvent>,
    options: PoolOptions,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<usize>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rotate the idle queue once, taking the first Alive connection.
    fn take_alive(&self) -> Option<usize> {
        let mut idle = self.idle();
        for _ in 0..idle.len() {
            let slot = idle.pop_front()?;
            if self.connections[slot].is_alive() {
                self.leased[slot].store(true, Ordering::Release);
                return Some(slot);
            }
            idle.push_back(slot);
        }
        None
    }

    fn give_back(&self, slot: usize, permit: OwnedSemaphorePermit) {
        self.leased[slot].store(false, Ordering::Release);
        self.idle().push_back(slot);
        drop(permit);
        self.wake.notify_waiters();
    }

    fn alive_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_alive()).count()
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Bounded, cloneable handle to the node connections.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for NodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("nodes", &self.inner.connections.len())
            .field("available", &self.available())
            .field("alive", &self.alive_count())
            .finish()
    }
}

impl NodePool {
    /// One Alive connection per address, in the given order.
    pub fn new<S: AsRef<str>>(addresses: &[S], options: PoolOptions) -> Result<Self> {
        if addresses.is_empty() {
            return Err(RiakError::Config(
                "at least one node address is required".into(),
            ));
        }
        let options = options.clamped();
        let connections = addresses
            .iter()
            .map(|a| Connection::new(a.as_ref(), options.request_timeout).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let n = connections.len();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        metrics::set_nodes_alive(n);
        Ok(Self {
            inner: Arc::new(PoolInner {
                leased: (0..n).map(|_| AtomicBool::new(false)).collect(),
                permits: Arc::new(Semaphore::new(n)),
                idle: Mutex::new((0..n).collect()),
                connections,
                wake: Notify::new(),
                events,
                options,
            }),
        })
    }

    /// Number of connections; never changes.
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Connections not currently on lease.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn alive_count(&self) -> usize {
        self.inner.alive_count()
    }

    pub fn ping_rate(&self) -> Duration {
        self.inner.options.ping_rate
    }

    /// All connections, leased or not. Probing them is safe.
    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.inner.connections
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        self.inner.emit(event);
    }

    /// Wake acquirers waiting out a fully Dead cluster.
    pub(crate) fn wake(&self) {
        self.inner.wake.notify_waiters();
    }

    pub fn stats(&self) -> Vec<NodeSnapshot> {
        self.inner
            .connections
            .iter()
            .zip(&self.inner.leased)
            .map(|(conn, leased)| NodeSnapshot {
                address: conn.address().to_string(),
                alive: conn.is_alive(),
                leased: leased.load(Ordering::Acquire),
                stats: conn.stats().snapshot(),
            })
            .collect()
    }

    /// Wait for an Alive connection.
    ///
    /// Cancel-safe: dropping the future before it resolves leaves the pool
    /// unchanged.
    pub async fn acquire(&self) -> Result<Lease> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| RiakError::Config("node pool closed".into()))?;

        let options = &self.inner.options;
        let mut backoff = options.acquire_backoff;
        let mut reported = false;
        loop {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.inner.take_alive() {
                debug!("Leased {}", self.inner.connections[slot].address());
                return Ok(Lease {
                    pool: Arc::clone(&self.inner),
                    slot,
                    permit: Some(permit),
                });
            }

            if !reported && self.inner.alive_count() == 0 {
                reported = true;
                let nodes = self.len();
                error!("Cluster unreachable: all {} nodes are down", nodes);
                metrics::record_cluster_unreachable();
                self.inner.emit(PoolEvent::ClusterUnreachable { nodes });
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
            let wait = backoff + Duration::from_millis(jitter_ms);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
            backoff = (backoff * 2).min(options.ping_rate.max(options.acquire_backoff));
        }
    }

    /// [`acquire`](Self::acquire) bounded by `limit`.
    ///
    /// Expiry yields `ClusterUnreachable` if every node is Dead at that
    /// point, else `Timeout`.
    pub async fn acquire_timeout(&self, limit: Duration) -> Result<Lease> {
        match tokio::time::timeout(limit, self.acquire()).await {
            Ok(lease) => lease,
            Err(_) if self.alive_count() == 0 => Err(RiakError::ClusterUnreachable {
                nodes: self.len(),
            }),
            Err(_) => Err(RiakError::Timeout {
                operation: "acquire".into(),
            }),
        }
    }

    /// Return a lease to this pool.
    ///
    /// A lease from another pool is reported as `NotLeased` and still goes
    /// back to the pool that issued it.
    pub fn release(&self, lease: Lease) -> Result<()> {
        if !Arc::ptr_eq(&self.inner, &lease.pool)
            || !self.inner.leased[lease.slot].load(Ordering::Acquire)
        {
            return Err(RiakError::NotLeased {
                address: lease.address().to_string(),
            });
        }
        drop(lease);
        Ok(())
    }
}

/// Exclusive use of one pooled connection.
pub struct Lease {
    pool: Arc<PoolInner>,
    slot: usize,
    permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.pool.connections[self.slot]
    }
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.pool.connections[self.slot]
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("address", &self.address())
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pool.give_back(self.slot, permit);
        }
    }
}
