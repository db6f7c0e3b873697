// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Broker Gateway - Resilient Brokerage Access
//!
//! Mediates every call to an unreliable, rate-limited brokerage API.
//!
//! # Architecture
//!
//! ## Layers (inside → outside)
//!
//! - **Resilience**: injected clock, token bucket, circuit breaker, retry
//!   policy, response cache
//! - **Ledger**: durable idempotency records and order log (SQLite), startup
//!   reconciliation of PENDING records
//! - **Gateway**: the call pipeline and the typed brokerage operations
//! - **Monitor**: background stop-loss evaluation that closes positions
//!   through the gateway's idempotent order path
//! - **Infrastructure**: the `PaperRemote` simulated brokerage
//!
//! Configuration lives in `config`, logging and metrics in `observability`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// YAML configuration with environment interpolation.
pub mod config;

/// Error taxonomy and credential redaction.
pub mod error;

/// Gateway pipeline and brokerage operations.
pub mod gateway;

/// Adapters implementing the remote port.
pub mod infrastructure;

/// Durable order ledger and reconciliation.
pub mod ledger;

/// Background risk monitor.
pub mod monitor;

/// Structured logging and metrics.
pub mod observability;

/// Rate limiting, circuit breaking, retry and caching primitives.
pub mod resilience;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{Config, load_config, load_config_or_default};
pub use error::{ErrorCode, GatewayError};
pub use gateway::{ApiResponse, Gateway, Instrument, Operation, PlaceOrderRequest, RemoteApi};
pub use infrastructure::PaperRemote;
pub use ledger::{IdempotencyKey, IdempotencyStatus, Ledger};
pub use monitor::{RiskMonitor, StopRule, TrailDistance};
pub use resilience::{Clock, ManualClock, SystemClock};
