//! Ledger record types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::gateway::{OrderSide, PlaceOrderRequest};

// ============================================================================
// Idempotency
// ============================================================================

/// Client-chosen identifier that makes order submission at-most-once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap an existing key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a random UUID v4 key.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Lifecycle of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    /// Attempt recorded, outcome not yet known.
    Pending,
    /// Remote accepted the order.
    Succeeded,
    /// Remote rejected the order or has no record of it.
    Failed,
}

impl IdempotencyStatus {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the outcome is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one idempotent order attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Idempotency key.
    pub key: IdempotencyKey,
    /// Canonical request parameters the key was first used with.
    pub fingerprint: String,
    /// Current status.
    pub status: IdempotencyStatus,
    /// Remote-assigned order id on success.
    pub remote_order_id: Option<String>,
    /// Failure reason on failure.
    pub error_message: Option<String>,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// Result of [`crate::ledger::Ledger::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// No record existed; a PENDING record was created.
    Fresh,
    /// A record already exists for the key.
    Duplicate(IdempotencyRecord),
}

/// Final outcome of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Remote accepted the order.
    Succeeded {
        /// Remote-assigned order id.
        remote_order_id: String,
    },
    /// Remote rejected or has no record of the order.
    Failed {
        /// Failure reason.
        reason: String,
    },
}

impl Outcome {
    /// Status this outcome transitions to.
    #[must_use]
    pub const fn status(&self) -> IdempotencyStatus {
        match self {
            Self::Succeeded { .. } => IdempotencyStatus::Succeeded,
            Self::Failed { .. } => IdempotencyStatus::Failed,
        }
    }
}

// ============================================================================
// Order ledger
// ============================================================================

/// Kind of order action recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerAction {
    /// New order.
    Place,
    /// Order modification.
    Modify,
    /// Order cancellation.
    Cancel,
    /// Protective close submitted by the risk monitor.
    Close,
}

impl LedgerAction {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Place => "PLACE",
            Self::Modify => "MODIFY",
            Self::Cancel => "CANCEL",
            Self::Close => "CLOSE",
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PLACE" => Some(Self::Place),
            "MODIFY" => Some(Self::Modify),
            "CANCEL" => Some(Self::Cancel),
            "CLOSE" => Some(Self::Close),
            _ => None,
        }
    }
}

/// Append-only order/trade log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry id (the idempotency key for keyed actions).
    pub entry_id: String,
    /// Idempotency key, for keyed actions.
    pub idempotency_key: Option<String>,
    /// Action kind.
    pub action: LedgerAction,
    /// Instrument traded.
    pub instrument: String,
    /// Order side, when known.
    pub side: Option<OrderSide>,
    /// Quantity.
    pub quantity: Decimal,
    /// Limit or reference price.
    pub price: Option<Decimal>,
    /// `SUCCEEDED` or `FAILED`.
    pub status: IdempotencyStatus,
    /// Remote order id.
    pub remote_order_id: Option<String>,
    /// Failure reason or remark.
    pub message: Option<String>,
    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Entry for a keyed order placement or close.
    #[must_use]
    pub fn for_order(
        key: &IdempotencyKey,
        action: LedgerAction,
        request: &PlaceOrderRequest,
        outcome: &Outcome,
    ) -> Self {
        let (remote_order_id, message) = match outcome {
            Outcome::Succeeded { remote_order_id } => (Some(remote_order_id.clone()), None),
            Outcome::Failed { reason } => (None, Some(reason.clone())),
        };
        Self {
            entry_id: key.to_string(),
            idempotency_key: Some(key.to_string()),
            action,
            instrument: request.instrument.key(),
            side: Some(request.side),
            quantity: request.quantity,
            price: request.price,
            status: outcome.status(),
            remote_order_id,
            message,
            recorded_at: Utc::now(),
        }
    }

    /// Notional value (`quantity * price`) when a price is known.
    #[must_use]
    pub fn notional(&self) -> Option<Decimal> {
        self.price.map(|p| p * self.quantity)
    }
}

/// Aggregate over successful placements and closes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSummary {
    /// Successful trades.
    pub trade_count: u64,
    /// Sum of buy notionals.
    pub bought_notional: Decimal,
    /// Sum of sell notionals.
    pub sold_notional: Decimal,
}

// ============================================================================
// Activity log
// ============================================================================

/// Severity shared by activity rows and monitor alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational.
    Info,
    /// Degraded but self-healing.
    Warning,
    /// Requires attention.
    Critical,
}

impl Severity {
    /// Stored representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing activity row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Row id.
    pub id: i64,
    /// Severity.
    pub severity: Severity,
    /// Category (e.g. `ORDER`, `RECONCILIATION`).
    pub category: String,
    /// Message.
    pub message: String,
    /// Related idempotency key.
    pub idempotency_key: Option<String>,
    /// When the row was written.
    pub recorded_at: DateTime<Utc>,
}
