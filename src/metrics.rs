//! Prometheus metrics for the client.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines metric name constants plus small recording helpers used by
//! connections, the pool and the health monitor.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::warn;

use crate::errors::Result;

// -- Metric name constants ----------------------------------------------------

/// Total node requests (counter). Labels: operation, outcome.
pub const REQUESTS_TOTAL: &str = "riakpool_requests_total";

/// Node request duration in seconds (histogram). Labels: operation.
pub const REQUEST_DURATION_SECONDS: &str = "riakpool_request_duration_seconds";

/// Connections currently marked Alive (gauge).
pub const NODES_ALIVE: &str = "riakpool_nodes_alive";

/// Times every node was found Dead at once (counter).
pub const CLUSTER_UNREACHABLE_TOTAL: &str = "riakpool_cluster_unreachable_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent; if another recorder
/// was installed first the returned handle renders nothing.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            warn!("metrics recorder already installed; local rendering disabled");
        }
        handle
    })
}

/// Install a recorder that serves the exposition format at `addr`.
///
/// Must run inside a Tokio runtime. Use instead of [`init_metrics`].
pub fn install_http_listener(addr: SocketAddr) -> std::result::Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

/// Register metric descriptions with the global recorder.
pub fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Total requests issued to cluster nodes");
    describe_histogram!(
        REQUEST_DURATION_SECONDS,
        "Node request duration in seconds"
    );
    describe_gauge!(NODES_ALIVE, "Connections currently marked alive");
    describe_counter!(
        CLUSTER_UNREACHABLE_TOTAL,
        "Health sweeps or acquires that found every node dead"
    );
}

/// Render the current exposition text, if [`init_metrics`] ran.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

// -- Recording helpers --------------------------------------------------------

/// Outcome label for a finished operation: `ok` or the error code.
pub fn outcome<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

pub fn record_request(operation: &'static str, outcome: &'static str, elapsed: Duration) {
    counter!(REQUESTS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
    histogram!(REQUEST_DURATION_SECONDS, "operation" => operation).record(elapsed.as_secs_f64());
}

pub fn set_nodes_alive(alive: usize) {
    gauge!(NODES_ALIVE).set(alive as f64);
}

pub fn record_cluster_unreachable() {
    counter!(CLUSTER_UNREACHABLE_TOTAL).increment(1);
}
