//! Observability: structured logging and Prometheus metrics.

mod logging;
mod metrics;

pub use logging::{LoggingError, build_filter, init_tracing};
pub use metrics::{
    MetricsError, init_metrics, record_cache_lookup, record_circuit_breaker_state,
    record_gateway_call, record_ledger_record, record_monitor_alert, record_monitor_cycle,
    record_rate_limiter_tokens, record_reconciliation_ambiguous, record_retry,
    update_monitored_positions,
};
