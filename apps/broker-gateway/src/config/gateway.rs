//! Gateway pipeline settings: rate limit, breaker, retry, cache, remote.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Token bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Maximum burst of calls.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Sustained calls per second.
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
    /// Maximum wait for a token (milliseconds).
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_second: default_refill_per_second(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl RateLimitSettings {
    /// Acquire timeout as a duration.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to stay open before probing.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Convert config settings to the resilience module's `CircuitBreakerConfig`.
    #[must_use]
    pub const fn to_resilience_config(&self) -> crate::resilience::CircuitBreakerConfig {
        crate::resilience::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff (milliseconds).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add random jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Convert to a `RetryPolicy`.
    #[must_use]
    pub const fn to_policy(&self) -> crate::resilience::RetryPolicy {
        crate::resilience::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

/// Per-operation cache TTLs (seconds) and cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Quotes and spot prices.
    #[serde(default = "default_quote_ttl")]
    pub quote: u64,
    /// Option chains.
    #[serde(default = "default_option_chain_ttl")]
    pub option_chain: u64,
    /// Open positions.
    #[serde(default = "default_positions_ttl")]
    pub positions: u64,
    /// Funds and balances.
    #[serde(default = "default_funds_ttl")]
    pub funds: u64,
    /// Margin.
    #[serde(default = "default_margin_ttl")]
    pub margin: u64,
    /// Historical candles.
    #[serde(default = "default_history_ttl")]
    pub history: u64,
    /// Order list, order detail and trade list.
    #[serde(default = "default_order_list_ttl")]
    pub order_list: u64,
    /// Customer details.
    #[serde(default = "default_customer_ttl")]
    pub customer: u64,
    /// Maximum cached responses.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Interval between expiry sweeps (seconds).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            quote: default_quote_ttl(),
            option_chain: default_option_chain_ttl(),
            positions: default_positions_ttl(),
            funds: default_funds_ttl(),
            margin: default_margin_ttl(),
            history: default_history_ttl(),
            order_list: default_order_list_ttl(),
            customer: default_customer_ttl(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Remote call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Per-attempt call timeout (milliseconds).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RemoteSettings {
    /// Call timeout as a duration.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

pub(crate) const fn default_true() -> bool {
    true
}

const fn default_capacity() -> u32 {
    10
}

const fn default_refill_per_second() -> f64 {
    5.0
}

const fn default_acquire_timeout_ms() -> u64 {
    30_000
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_recovery_timeout_secs() -> u64 {
    60
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_quote_ttl() -> u64 {
    5
}

const fn default_option_chain_ttl() -> u64 {
    30
}

const fn default_positions_ttl() -> u64 {
    10
}

const fn default_funds_ttl() -> u64 {
    60
}

const fn default_margin_ttl() -> u64 {
    30
}

const fn default_history_ttl() -> u64 {
    300
}

const fn default_order_list_ttl() -> u64 {
    5
}

const fn default_customer_ttl() -> u64 {
    300
}

const fn default_max_entries() -> usize {
    1024
}

const fn default_sweep_interval_secs() -> u64 {
    30
}

const fn default_call_timeout_ms() -> u64 {
    10_000
}
