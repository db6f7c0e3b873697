//! Token bucket rate limiter for outbound remote calls.
//!
//! The bucket holds at most `capacity` tokens and refills continuously at
//! `refill_per_second`. Refill is computed lazily from elapsed time on every
//! access, so there is no background timer and suspension does not cause
//! drift.
//!
//! # Example
//!
//! ```rust,ignore
//! use broker_gateway::resilience::{SystemClock, TokenBucketLimiter};
//!
//! let limiter = TokenBucketLimiter::new(10, 5.0, Arc::new(SystemClock));
//! limiter.acquire(1, Duration::from_secs(30)).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use super::clock::Clock;

/// Tolerance for floating point refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// Tokens could not be granted within the allowed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{requested} rate token(s) not available within {timeout_ms}ms")]
pub struct RateLimitTimeout {
    /// Tokens requested.
    pub requested: u32,
    /// Wait budget in milliseconds.
    pub timeout_ms: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a full bucket. A non-positive rate never refills.
    #[must_use]
    pub fn new(capacity: u32, refill_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_per_second: refill_per_second.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: clock.now(),
            }),
            clock,
        }
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens currently available after refill.
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Take `tokens` if they are available right now.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        self.take_or_wait(f64::from(tokens)).is_none()
    }

    /// Take `tokens`, waiting up to `timeout` for the bucket to refill.
    ///
    /// Requests larger than the capacity can never be satisfied and fail
    /// immediately. When the refill needed exceeds the remaining wait budget
    /// the call fails without sleeping.
    pub async fn acquire(&self, tokens: u32, timeout: Duration) -> Result<(), RateLimitTimeout> {
        let needed = f64::from(tokens);
        let timed_out = RateLimitTimeout {
            requested: tokens,
            timeout_ms: timeout.as_millis() as u64,
        };

        if needed > self.capacity + TOKEN_EPSILON {
            return Err(timed_out);
        }

        let deadline = self.clock.now() + timeout;

        loop {
            let Some(wait) = self.take_or_wait(needed) else {
                crate::observability::record_rate_limiter_tokens(self.available());
                return Ok(());
            };

            let now = self.clock.now();
            let remaining = deadline.saturating_duration_since(now);
            if wait > remaining {
                tracing::debug!(
                    requested = tokens,
                    wait_ms = wait.as_millis() as u64,
                    remaining_ms = remaining.as_millis() as u64,
                    "Rate token wait exceeds budget"
                );
                return Err(timed_out);
            }

            self.clock.sleep(wait).await;
        }
    }

    /// Debit `needed` tokens, or return the exact wait until they exist.
    fn take_or_wait(&self, needed: f64) -> Option<Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens + TOKEN_EPSILON >= needed {
            state.tokens = (state.tokens - needed).max(0.0);
            return None;
        }

        // Waits too long to represent can never fit a budget.
        let deficit = needed - state.tokens;
        Some(Duration::try_from_secs_f64(deficit / self.refill_per_second).unwrap_or(Duration::MAX))
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
    }
}
