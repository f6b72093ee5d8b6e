//! Prometheus metrics for the connector subsystem.
//!
//! Shaped like the CSI driver's own metrics module: named-constant metric
//! names, free functions to record them, and an `OperationTimer` helper for
//! the common "time it, then record success/failure" pattern. Not part of
//! any external contract — purely ambient observability alongside the
//! `tracing` log lines each component already emits.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub mod names {
    /// Counter: attach/detach/resize outcomes by operation and error kind.
    pub const CONNECTOR_OPERATIONS_TOTAL: &str = "connector_operations_total";
    /// Histogram: duration of a full attach/detach/resize call, seconds.
    pub const CONNECTOR_OPERATION_DURATION_SECONDS: &str = "connector_operation_duration_seconds";
    /// Gauge: permits currently checked out per operation class.
    pub const CONNECTOR_SEMAPHORE_IN_USE: &str = "connector_semaphore_in_use";
    /// Counter: rescan/poll retries issued by a protocol attacher.
    pub const CONNECTOR_RESCANS_TOTAL: &str = "connector_rescans_total";
}

/// Starts an HTTP server serving `/metrics` at `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("connector metrics listening on http://{}/metrics", addr);
    Ok(())
}

/// Record one attach/detach/resize outcome. `error_kind` is `"ok"` on
/// success or the `ConnectorError` variant name on failure.
pub fn record_operation(operation: &str, error_kind: &str, duration_secs: f64) {
    counter!(
        names::CONNECTOR_OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "result" => error_kind.to_string()
    )
    .increment(1);
    histogram!(names::CONNECTOR_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn set_semaphore_in_use(class: &str, permits_in_use: usize) {
    gauge!(names::CONNECTOR_SEMAPHORE_IN_USE, "class" => class.to_string()).set(permits_in_use as f64);
}

pub fn record_rescan(protocol: &str) {
    counter!(names::CONNECTOR_RESCANS_TOTAL, "protocol" => protocol.to_string()).increment(1);
}

/// Times a single operation from construction to `success`/`failure`.
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "ok", duration);
    }

    pub fn failure(self, error_kind: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_kind, duration);
    }
}
