//! riakpool: pooled, liveness-tracking client for Riak-style HTTP
//! key-value clusters.
//!
//! A [`NodePool`] leases [`Connection`]s to callers one at a time, a
//! [`HealthMonitor`] probes every node in the background, and each
//! connection speaks the object, bucket-property and counter protocol,
//! translating HTTP status codes into [`RiakError`].

pub mod bucket;
pub mod config;
pub mod connection;
pub mod errors;
pub mod metrics;
pub mod monitor;
pub mod object;
pub mod pool;
pub mod resources;
pub mod stats;

#[cfg(test)]
mod testing;

pub use bucket::{BucketProperties, Counter, Quorum};
pub use connection::Connection;
pub use errors::{deadline, Result, RiakError};
pub use monitor::{HealthMonitor, MonitorHandle, SweepReport};
pub use object::{DeleteOptions, FetchOptions, Link, Object, StoreOptions};
pub use pool::{Lease, NodePool, NodeSnapshot, PoolEvent, PoolOptions};
pub use resources::{NodeStatus, Resources};
pub use stats::{Stats, StatsSnapshot};
