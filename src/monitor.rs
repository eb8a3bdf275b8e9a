//! Background liveness probing.
//!
//! Each sweep pings every pooled connection concurrently, leased or not.
//! Probe outcomes are the only way a Dead connection becomes Alive again.
//! Failures are absorbed here: they are logged and published as
//! [`PoolEvent`]s, never returned to foreground callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::pool::{NodePool, PoolEvent, MIN_INTERVAL};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub alive: usize,
    pub dead: usize,
    /// Addresses that came back during this sweep.
    pub revived: Vec<String>,
    /// Addresses that went down since the previous sweep, including
    /// nodes a foreground call marked Dead that this sweep revived.
    pub lost: Vec<String>,
}

impl SweepReport {
    pub fn cluster_unreachable(&self) -> bool {
        self.alive == 0
    }
}

/// Periodic prober for a [`NodePool`].
pub struct HealthMonitor {
    pool: NodePool,
    ping_rate: Duration,
    /// Liveness last published for each node.
    last_seen: Mutex<Vec<bool>>,
}

impl HealthMonitor {
    /// Monitor `pool` at its configured ping rate.
    pub fn new(pool: NodePool) -> Self {
        let ping_rate = pool.ping_rate();
        Self::with_ping_rate(pool, ping_rate)
    }

    /// Monitor `pool` every `ping_rate`, floored at one millisecond.
    pub fn with_ping_rate(pool: NodePool, ping_rate: Duration) -> Self {
        let last_seen = vec![true; pool.len()];
        Self {
            pool,
            ping_rate: ping_rate.max(MIN_INTERVAL),
            last_seen: Mutex::new(last_seen),
        }
    }

    pub fn ping_rate(&self) -> Duration {
        self.ping_rate
    }

    /// Probe every connection once and publish liveness changes.
    pub async fn sweep(&self) -> SweepReport {
        let connections = self.pool.connections();
        // Foreground calls may have killed a node since the last sweep.
        let alive_before: Vec<bool> = connections.iter().map(|c| c.is_alive()).collect();
        let mut probes = JoinSet::new();
        for (slot, conn) in connections.iter().enumerate() {
            let conn = Arc::clone(conn);
            probes.spawn(async move { (slot, conn.probe().await) });
        }

        let mut up = vec![false; connections.len()];
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((slot, Ok(()))) => up[slot] = true,
                Ok((slot, Err(e))) => {
                    debug!("Probe of {} failed: {}", connections[slot].address(), e)
                }
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        let mut report = SweepReport::default();
        let mut events = Vec::new();
        {
            let mut last_seen = self
                .last_seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (slot, (&now, reported)) in up.iter().zip(last_seen.iter_mut()).enumerate() {
                let address = connections[slot].address().to_string();
                if now {
                    report.alive += 1;
                } else {
                    report.dead += 1;
                }
                let was_alive = *reported && alive_before[slot];
                if *reported && !(was_alive && now) {
                    warn!("Node {} failed its health check", address);
                    report.lost.push(address.clone());
                    events.push(PoolEvent::NodeDown {
                        address: address.clone(),
                    });
                }
                if !was_alive && now {
                    report.revived.push(address.clone());
                    events.push(PoolEvent::NodeRevived { address });
                }
                *reported = now;
            }
        }

        for event in events {
            self.pool.emit(event);
        }
        if !report.revived.is_empty() {
            info!("Revived nodes: {}", report.revived.join(", "));
            self.pool.wake();
        }
        metrics::set_nodes_alive(report.alive);
        if report.cluster_unreachable() {
            let nodes = connections.len();
            error!("Cluster unreachable: all {} nodes failed their health check", nodes);
            metrics::record_cluster_unreachable();
            self.pool.emit(PoolEvent::ClusterUnreachable { nodes });
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `ping_rate` on a background task.
    pub fn start(self) -> MonitorHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let rate = self.ping_rate;
        info!(
            "Health monitor started for {} nodes every {:?}",
            self.pool.len(),
            rate
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(rate);
            // The first tick completes immediately; skip it.
            interval.tick().await;

            loop {
                interval.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                self.sweep().await;
            }
        });
        MonitorHandle { shutdown, task }
    }
}

/// Owner of a running monitor task. Dropping it stops the task.
pub struct MonitorHandle {
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
