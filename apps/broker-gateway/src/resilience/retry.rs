//! Retry policy with exponential backoff and failure classification.
//!
//! # Classification
//!
//! | Transient (retried) | Permanent (surfaced immediately) |
//! |---------------------|----------------------------------|
//! | HTTP 408, 429, 5xx | Other HTTP 4xx |
//! | Timeouts, connection reset/refused, DNS | Invalid session, unauthorized, forbidden |
//! | "service unavailable", "bad gateway", ... | Invalid API key or credentials |
//! | Unrecognised errors | Session expired, not connected |
//!
//! # Backoff
//!
//! The delay before retry `n` (0-based) is `base * 2^n + jitter`, where the
//! jitter is drawn uniformly from `[0, base]`, capped at `max_delay`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    /// Retrying may succeed.
    Transient,
    /// Retrying will fail the same way.
    Permanent,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Permanent => write!(f, "PERMANENT"),
        }
    }
}

/// HTTP status codes outside 5xx that are transient.
const TRANSIENT_STATUS_CODES: &[u16] = &[
    408, // Request Timeout
    429, // Too Many Requests
];

/// Message fragments that mark a failure as permanent. Checked first.
const PERMANENT_PATTERNS: &[&str] = &[
    "invalid session",
    "session expired",
    "unauthorized",
    "invalid api key",
    "forbidden",
    "not connected",
    "authentication failed",
    "invalid credentials",
];

/// Message fragments that mark a failure as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "service unavailable",
    "gateway timeout",
    "bad gateway",
    "too many requests",
    "rate limit",
    "connection reset",
    "connection refused",
    "read timed out",
    "temporary failure",
    "network error",
    "timeout",
    "dns",
    "broken pipe",
    "503",
    "502",
    "504",
    "429",
];

/// Classify an HTTP status code. 2xx/3xx codes are not failures and are
/// reported as transient only if a caller asks.
#[must_use]
pub fn classify_status(status: u16) -> FailureClass {
    if (500..600).contains(&status) || TRANSIENT_STATUS_CODES.contains(&status) {
        return FailureClass::Transient;
    }
    if (400..500).contains(&status) {
        return FailureClass::Permanent;
    }
    FailureClass::Transient
}

/// Classify a failure from its message text.
///
/// Unknown messages are treated as transient.
#[must_use]
pub fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_lowercase();

    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureClass::Permanent;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureClass::Transient;
    }

    FailureClass::Transient
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Base backoff delay.
    pub base_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Whether to add `[0, base]` random jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Whether another attempt should follow failed attempt `attempt` (1-based).
    #[must_use]
    pub fn should_retry(&self, class: FailureClass, attempt: u32) -> bool {
        class == FailureClass::Transient && attempt < self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential = base_ms.saturating_mul(1_u64 << retry.min(32));

        let jitter = if self.jitter && base_ms > 0 {
            rand::rng().random_range(0..=base_ms)
        } else {
            0
        };

        let max_ms = self.max_delay.as_millis() as u64;
        Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
    }
}
