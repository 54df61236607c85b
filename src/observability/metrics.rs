//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_breaker_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `gateway_breaker_calls_total` (counter): call outcomes by service
//! - `gateway_call_duration_seconds` (histogram): upstream latency
//! - `gateway_rate_limit_decisions_total` (counter): allowed / denied / blacklisted
//! - `gateway_rate_limit_fail_open_total` (counter): store outages absorbed
//! - `gateway_retries_total` (counter): retries by error kind
//! - `gateway_service_health` (gauge): 1=healthy, 0=unhealthy, -1=unknown
//! - `gateway_fallback_served_total` (counter): degraded responses by service
//!
//! Recording is a no-op until a recorder is installed, so the library can be
//! used (and tested) without the exporter.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use crate::health::HealthStatus;
use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_breaker_state(service: &str, state: CircuitState) {
    gauge!("gateway_breaker_state", "service" => service.to_string()).set(state.as_metric_value());
}

pub fn record_call(service: &str, outcome: &'static str, latency: Duration) {
    counter!("gateway_breaker_calls_total", "service" => service.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("gateway_call_duration_seconds", "service" => service.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_rejected(service: &str) {
    counter!("gateway_breaker_calls_total", "service" => service.to_string(), "outcome" => "rejected")
        .increment(1);
}

pub fn record_rate_limit(decision: &'static str) {
    counter!("gateway_rate_limit_decisions_total", "decision" => decision).increment(1);
}

pub fn record_fail_open() {
    counter!("gateway_rate_limit_fail_open_total").increment(1);
}

pub fn record_retry(kind: &'static str) {
    counter!("gateway_retries_total", "kind" => kind).increment(1);
}

pub fn record_service_health(service: &str, status: HealthStatus) {
    let value = match status {
        HealthStatus::Healthy => 1.0,
        HealthStatus::Unhealthy => 0.0,
        HealthStatus::Unknown => -1.0,
    };
    gauge!("gateway_service_health", "service" => service.to_string()).set(value);
}

pub fn record_fallback(service: &str) {
    counter!("gateway_fallback_served_total", "service" => service.to_string()).increment(1);
}
