//! Resilience patterns for remote brokerage calls.
//!
//! Rate limiting, circuit breaking, retry with backoff and response caching.
//! Each primitive is an owned object built per gateway, reading time through
//! an injected [`Clock`].

mod cache;
mod circuit_breaker;
mod clock;
mod rate_limiter;
mod retry;

pub use cache::{CacheKey, CacheStats, ResponseCache, canonical_params};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerState,
    CircuitOpen,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use rate_limiter::{RateLimitTimeout, TokenBucketLimiter};
pub use retry::{FailureClass, RetryPolicy, classify_message, classify_status};
