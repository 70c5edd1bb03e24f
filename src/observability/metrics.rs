//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): terminal responses by status, service
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_rate_limited_total` (counter): rejected by the limiter, by service
//! - `gateway_backend_connections_total` (counter): created / reused / failed
//! - `gateway_pool_idle`, `gateway_pool_keep_alive` (gauge): pooled connections
//! - `gateway_in_flight` (gauge): requests awaiting a backend response
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with its HTTP listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(status: u16, service_id: &str, elapsed: Duration) {
    counter!(
        "gateway_requests_total",
        "status" => status.to_string(),
        "service" => service_id.to_string()
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_rate_limited(service_id: &str) {
    counter!("gateway_rate_limited_total", "service" => service_id.to_string()).increment(1);
}

/// `outcome` is one of `created`, `reused`, `failed`.
pub fn record_backend_connection(outcome: &'static str) {
    counter!("gateway_backend_connections_total", "outcome" => outcome).increment(1);
}

pub fn set_pool_gauges(idle: usize, keep_alive: usize) {
    gauge!("gateway_pool_idle").set(idle as f64);
    gauge!("gateway_pool_keep_alive").set(keep_alive as f64);
}

pub fn set_in_flight(count: usize) {
    gauge!("gateway_in_flight").set(count as f64);
}
