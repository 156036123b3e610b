//! Metrics collection and export for the broker.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "tether_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "tether_sessions_active";
    pub const AUTH_FAILURES_TOTAL: &str = "tether_auth_failures_total";
    pub const TELEMETRY_DATAGRAMS_TOTAL: &str = "tether_telemetry_datagrams_total";
    pub const BRIDGE_REQUESTS_TOTAL: &str = "tether_bridge_requests_total";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of accepted connections since broker start"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of refused authentications"
    );
    metrics::describe_counter!(
        names::TELEMETRY_DATAGRAMS_TOTAL,
        "Total number of telemetry datagrams received"
    );
    metrics::describe_counter!(
        names::BRIDGE_REQUESTS_TOTAL,
        "Total number of HTTP bridge requests"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted connection.
pub fn record_connection() {
    counter!(names::SESSIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

/// Record a connection teardown.
pub fn record_disconnection() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a refused authentication.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Record a telemetry datagram, accepted or dropped.
pub fn record_telemetry(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "dropped" };
    counter!(names::TELEMETRY_DATAGRAMS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a bridge request by endpoint.
pub fn record_bridge_request(endpoint: &'static str) {
    counter!(names::BRIDGE_REQUESTS_TOTAL, "endpoint" => endpoint).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
