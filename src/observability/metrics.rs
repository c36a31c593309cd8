//! Metrics collection and exposition.
//!
//! # Metrics
//! - `listenstats_requests_total` (counter): requests by method, status
//! - `listenstats_request_duration_seconds` (histogram): request latency
//! - `listenstats_rate_limited_total` (counter): rejections by route class
//! - `listenstats_rate_store_errors_total` (counter): store failures that failed open
//! - `listenstats_auth_failures_total` (counter): authentication failures by kind
//! - `listenstats_credential_reuse_total` (counter): rotation families revoked
//! - `listenstats_csrf_rejections_total` (counter)
//! - `listenstats_upstream_calls_total` (counter): upstream calls by dependency, outcome
//! - `listenstats_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, duration: Duration) {
    counter!(
        "listenstats_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("listenstats_request_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_rate_limited(class: &'static str) {
    counter!("listenstats_rate_limited_total", "class" => class).increment(1);
}

pub fn record_rate_store_error() {
    counter!("listenstats_rate_store_errors_total").increment(1);
}

pub fn record_auth_failure(kind: &'static str) {
    counter!("listenstats_auth_failures_total", "kind" => kind).increment(1);
}

pub fn record_credential_reuse() {
    counter!("listenstats_credential_reuse_total").increment(1);
}

pub fn record_csrf_rejection() {
    counter!("listenstats_csrf_rejections_total").increment(1);
}

pub fn record_upstream_call(dependency: &str, outcome: &'static str) {
    counter!(
        "listenstats_upstream_calls_total",
        "dependency" => dependency.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_circuit_state(dependency: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("listenstats_circuit_state", "dependency" => dependency.to_string()).set(value);
}
