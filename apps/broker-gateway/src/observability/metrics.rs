//! Prometheus metrics for the broker gateway.
//!
//! All recorders go through the `metrics` facade and are no-ops until
//! [`init_metrics`] installs the exporter.
//!
//! # Example
//!
//! ```ignore
//! use broker_gateway::config::MetricsSettings;
//! use broker_gateway::observability::init_metrics;
//!
//! let settings = MetricsSettings { enabled: true, listen_addr: "0.0.0.0:9090".into() };
//! init_metrics(&settings)?;
//! ```

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsSettings;
use crate::ledger::{IdempotencyStatus, Severity};
use crate::resilience::CircuitBreakerState;

/// Latency buckets from 1ms to 30s.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Listen address could not be parsed.
    #[error("invalid metrics listen address '{0}'")]
    Address(String),
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Install the Prometheus exporter when enabled.
///
/// Starts an HTTP listener that serves `/metrics`. Returns `Ok(false)` when
/// metrics are disabled.
///
/// # Errors
///
/// Returns an error if the address is invalid or the exporter fails to start.
pub fn init_metrics(settings: &MetricsSettings) -> Result<bool, MetricsError> {
    if !settings.enabled {
        return Ok(false);
    }

    let addr: SocketAddr = settings
        .listen_addr
        .parse()
        .map_err(|_| MetricsError::Address(settings.listen_addr.clone()))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(LATENCY_BUCKETS)
        .map_err(|e| MetricsError::Configuration(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(true)
}

// ============================================================================
// Gateway Metrics
// ============================================================================

/// Record a completed gateway call.
///
/// # Arguments
///
/// * `endpoint` - Remote endpoint (e.g., "quote", "place_order")
/// * `outcome` - `"ok"`, `"cached"` or an error reason
/// * `latency_seconds` - Time spent in the pipeline
pub fn record_gateway_call(endpoint: &str, outcome: &str, latency_seconds: f64) {
    counter!(
        "gateway_calls_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        "gateway_call_latency_seconds",
        "endpoint" => endpoint.to_string()
    )
    .record(latency_seconds);
}

/// Record a retry of a transient failure.
pub fn record_retry(endpoint: &str) {
    counter!("gateway_retries_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Record a cache lookup.
pub fn record_cache_lookup(endpoint: &str, hit: bool) {
    counter!(
        "gateway_cache_total",
        "endpoint" => endpoint.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Update the available token gauge.
pub fn record_rate_limiter_tokens(available: f64) {
    gauge!("rate_limiter_tokens_available").set(available);
}

/// Record a circuit breaker state change.
///
/// # Arguments
///
/// * `name` - Breaker name
/// * `state` - New state (gauge: 0=closed, 1=open, 2=`half_open`)
pub fn record_circuit_breaker_state(name: &str, state: CircuitBreakerState) {
    gauge!("circuit_breaker_state", "name" => name.to_string()).set(state.as_gauge());
}

// ============================================================================
// Ledger Metrics
// ============================================================================

/// Record an idempotency record reaching `status`.
pub fn record_ledger_record(status: IdempotencyStatus) {
    counter!("ledger_records_total", "status" => status.as_str()).increment(1);
}

/// Record an order whose outcome could not be reconciled.
pub fn record_reconciliation_ambiguous() {
    counter!("ledger_reconciliation_ambiguous_total").increment(1);
}

// ============================================================================
// Risk Monitor Metrics
// ============================================================================

/// Record a risk monitor alert.
pub fn record_monitor_alert(severity: Severity) {
    counter!("risk_monitor_alerts_total", "severity" => severity.as_str()).increment(1);
}

/// Record the duration of one monitoring cycle.
pub fn record_monitor_cycle(duration_seconds: f64) {
    histogram!("risk_monitor_cycle_seconds").record(duration_seconds);
}

/// Update the number of active stop rules.
pub fn update_monitored_positions(count: usize) {
    gauge!("risk_monitor_rules").set(count as f64);
}

// ============================================================================
// Tests
// ============================================================================
