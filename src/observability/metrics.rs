//! Metrics collection and exposition.
//!
//! # Metrics
//! - `edge_connections_admitted_total` (counter): connections let through the limiter
//! - `edge_connections_active` (gauge): admission slots currently held
//! - `edge_certificate_reloads_total` (counter): successful certificate loads
//! - `edge_certificate_load_failures_total` (counter): rejected certificate loads
//! - `edge_tls_handshake_failures_total` (counter): failed handshakes by reason

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_admitted() {
    ::metrics::counter!("edge_connections_admitted_total").increment(1);
    ::metrics::gauge!("edge_connections_active").increment(1.0);
}

pub fn record_slot_released() {
    ::metrics::gauge!("edge_connections_active").decrement(1.0);
}

pub fn record_certificate_reload() {
    ::metrics::counter!("edge_certificate_reloads_total").increment(1);
}

pub fn record_certificate_load_failure() {
    ::metrics::counter!("edge_certificate_load_failures_total").increment(1);
}

pub fn record_handshake_failure(reason: &'static str) {
    ::metrics::counter!("edge_tls_handshake_failures_total", "reason" => reason).increment(1);
}
