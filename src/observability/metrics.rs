//! Metrics collection and exposition.
//!
//! # Metrics
//! - `server_connections_accepted_total` (counter)
//! - `server_clients_connected` (gauge): open sessions in this process
//! - `server_requests_total` (counter): fully parsed requests
//! - `server_handoffs_total` (counter): by `outcome` = ok | failed
//! - `server_session_errors_total` (counter): by `kind`
//! - `cluster_workers` (gauge): registered workers (master only)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve `/metrics` on `address`.
pub fn init_metrics(address: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;
    tracing::info!(address = %address, "Metrics exporter listening");
    Ok(())
}

pub fn record_accept() {
    ::metrics::counter!("server_connections_accepted_total").increment(1);
}

pub fn record_clients_connected(count: u64) {
    ::metrics::gauge!("server_clients_connected").set(count as f64);
}

pub fn record_request() {
    ::metrics::counter!("server_requests_total").increment(1);
}

pub fn record_handoff(outcome: &'static str) {
    ::metrics::counter!("server_handoffs_total", "outcome" => outcome).increment(1);
}

pub fn record_session_error(kind: &'static str) {
    ::metrics::counter!("server_session_errors_total", "kind" => kind).increment(1);
}

pub fn record_workers(count: usize) {
    ::metrics::gauge!("cluster_workers").set(count as f64);
}
