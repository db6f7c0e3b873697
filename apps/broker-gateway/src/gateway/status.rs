//! Connection health reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ErrorCode;
use crate::resilience::{CacheStats, CircuitBreakerMetrics, CircuitBreakerState};

/// Snapshot of gateway health for operators and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Breaker state.
    pub breaker_state: CircuitBreakerState,
    /// Consecutive failures recorded by the breaker.
    pub consecutive_failures: u32,
    /// Rate tokens currently available.
    pub tokens_available: f64,
    /// Bucket capacity.
    pub token_capacity: f64,
    /// Seconds since the gateway was built.
    pub uptime_secs: u64,
    /// Response cache counters.
    pub cache: CacheStats,
    /// Operations requested.
    pub total_calls: u64,
    /// Attempts that reached the remote.
    pub remote_calls: u64,
    /// Operations that ended in an error.
    pub failed_calls: u64,
    /// Kind of the most recent error.
    pub last_error: Option<ErrorCode>,
    /// Full breaker counters.
    pub breaker: CircuitBreakerMetrics,
}

impl ConnectionStatus {
    /// Whether calls are flowing normally.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.breaker_state == CircuitBreakerState::Closed
    }
}

/// Running call counters.
#[derive(Debug, Default)]
pub(crate) struct CallStats {
    total_calls: AtomicU64,
    remote_calls: AtomicU64,
    failed_calls: AtomicU64,
    last_error: Mutex<Option<ErrorCode>>,
}

impl CallStats {
    pub(crate) fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_attempt(&self) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, code: ErrorCode) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(code);
    }

    pub(crate) fn totals(&self) -> (u64, u64, u64, Option<ErrorCode>) {
        (
            self.total_calls.load(Ordering::Relaxed),
            self.remote_calls.load(Ordering::Relaxed),
            self.failed_calls.load(Ordering::Relaxed),
            *self.last_error.lock(),
        )
    }
}
