//! Circuit breaker for the remote brokerage dependency.
//!
//! Sheds load while the remote is failing and probes for recovery with a
//! single call at a time.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN (consecutive failures >= failure_threshold)
//! OPEN → HALF_OPEN (recovery_timeout elapsed)
//! HALF_OPEN → CLOSED (probe succeeds)
//! HALF_OPEN → OPEN (probe fails, recovery timer restarts)
//! ```
//!
//! Admission hands out a [`CallPermit`]. While HALF_OPEN exactly one permit
//! (the probe) is outstanding; every other caller fails fast with
//! [`CircuitOpen`] until the probe resolves.
//!
//! # Example
//!
//! ```rust,ignore
//! let permit = breaker.try_acquire()?;
//! match remote_call().await {
//!     Ok(reply) => permit.succeed(),
//!     Err(_) => permit.fail(),
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use super::clock::Clock;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Circuit is closed, calls flow normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is admitting a single probe call.
    HalfOpen,
}

impl CircuitBreakerState {
    /// Numeric encoding used by the state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time to stay OPEN before a probe is admitted.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Call rejected because the circuit is not admitting traffic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{name}' is {state}")]
pub struct CircuitOpen {
    /// Breaker name.
    pub name: String,
    /// State at rejection time.
    pub state: CircuitBreakerState,
    /// Time until the next probe may be admitted, when known.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejected: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            clock,
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any elapsed recovery timeout.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock();
        self.check_recovery(&mut inner);
        inner.state
    }

    /// Consecutive failures recorded since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask to make a call.
    ///
    /// CLOSED always admits. OPEN rejects until the recovery timeout has
    /// elapsed, then moves to HALF_OPEN. HALF_OPEN admits one probe and
    /// rejects everyone else until the probe resolves.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let mut inner = self.inner.lock();
        self.check_recovery(&mut inner);

        match inner.state {
            CircuitBreakerState::Closed => Ok(CallPermit::new(self, false)),
            CircuitBreakerState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                tracing::info!(name = %self.name, "Circuit breaker admitting probe call");
                Ok(CallPermit::new(self, true))
            }
            state => {
                let retry_after = self.time_until_probe(&inner);
                drop(inner);
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                Err(CircuitOpen {
                    name: self.name.clone(),
                    state,
                    retry_after,
                })
            }
        }
    }

    fn on_success(&self, probe: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitBreakerState::Closed => inner.consecutive_failures = 0,
            CircuitBreakerState::HalfOpen if probe => {
                inner.consecutive_failures = 0;
                self.transition(&mut inner, CircuitBreakerState::Closed);
            }
            // A call admitted before a forced open does not close the circuit.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitBreakerState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::HalfOpen if probe => {
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.probe_in_flight {
            inner.probe_in_flight = false;
            tracing::debug!(name = %self.name, "Unresolved probe released");
        }
    }

    /// Check for the time-based `OPEN` -> `HALF_OPEN` transition.
    fn check_recovery(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitBreakerState::Open
            && let Some(opened) = inner.opened_at
            && self.clock.now().saturating_duration_since(opened) >= self.config.recovery_timeout
        {
            self.transition(inner, CircuitBreakerState::HalfOpen);
        }
    }

    fn time_until_probe(&self, inner: &BreakerInner) -> Option<Duration> {
        match inner.state {
            CircuitBreakerState::Open => inner.opened_at.map(|opened| {
                self.config
                    .recovery_timeout
                    .saturating_sub(self.clock.now().saturating_duration_since(opened))
            }),
            _ => None,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitBreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        match to {
            CircuitBreakerState::Open => {
                inner.opened_at = Some(self.clock.now());
                inner.probe_in_flight = false;
                tracing::warn!(
                    name = %self.name,
                    from = %from,
                    to = "OPEN",
                    consecutive_failures = inner.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            CircuitBreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                tracing::info!(name = %self.name, from = %from, to = "HALF_OPEN", "Circuit breaker testing");
            }
            CircuitBreakerState::Closed => {
                inner.opened_at = None;
                inner.probe_in_flight = false;
                inner.consecutive_failures = 0;
                tracing::info!(name = %self.name, from = %from, to = "CLOSED", "Circuit breaker closed");
            }
        }

        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        crate::observability::record_circuit_breaker_state(&self.name, to);
    }

    /// Snapshot of counters and state.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        self.check_recovery(&mut inner);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            next_probe_in: self.time_until_probe(&inner),
        }
    }

    /// Force the circuit breaker to open (operator override).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Open);
    }

    /// Force the circuit breaker to close (operator override).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitBreakerState::Closed);
    }
}

/// Admission ticket for a single call.
///
/// Resolve with [`CallPermit::succeed`] or [`CallPermit::fail`]. Dropping an
/// unresolved permit records nothing; an unresolved probe frees its slot so
/// the next caller can probe.
#[derive(Debug)]
#[must_use = "a permit must be resolved with succeed() or fail()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    const fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    /// Whether this permit is the HALF_OPEN probe.
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a successful call.
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    /// Record a failed call.
    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Metrics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Consecutive failures.
    pub consecutive_failures: u32,
    /// Resolved calls.
    pub total_calls: u64,
    /// Failed calls.
    pub total_failures: u64,
    /// Calls rejected without reaching the remote.
    pub total_rejected: u64,
    /// Number of state transitions.
    pub state_transitions: u64,
    /// Time until a probe may be admitted while OPEN.
    pub next_probe_in: Option<Duration>,
}
