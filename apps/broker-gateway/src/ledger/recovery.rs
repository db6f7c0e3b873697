//! Resolution of PENDING idempotency records.
//!
//! A record stays PENDING when the process dies, or the remote stops
//! answering, between recording an attempt and learning its outcome. The
//! [`Reconciler`] asks the remote whether an order carrying the key exists:
//!
//! - found on any lookup: the record becomes SUCCEEDED
//! - absent on every lookup: the record becomes FAILED
//! - lookups failed without ever finding it: the record stays PENDING and a
//!   CRITICAL activity row is written for the operator

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::records::{IdempotencyKey, IdempotencyRecord, LedgerAction, LedgerEntry, Outcome, Severity};
use super::store::{Ledger, LedgerError};
use crate::error::GatewayError;
use crate::gateway::PlaceOrderRequest;
use crate::resilience::Clock;

/// Prefix of idempotency keys generated for protective closes.
pub const CLOSE_KEY_PREFIX: &str = "stop-";

/// Activity category for reconciliation rows.
pub const RECONCILIATION_CATEGORY: &str = "RECONCILIATION";

/// Answer from a remote order lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The remote has an order carrying the key.
    Found {
        /// Remote-assigned order id.
        remote_order_id: String,
    },
    /// The remote has no such order.
    NotFound,
}

/// Port for asking the remote whether an order with a given client key exists.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderLookup: Send + Sync {
    /// Look up the order submitted with `key`.
    async fn lookup_order(&self, key: &IdempotencyKey) -> Result<LookupResult, GatewayError>;
}

/// How one PENDING record was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The remote has the order.
    Succeeded(IdempotencyRecord),
    /// The remote never received the order.
    Failed(IdempotencyRecord),
    /// Record was already final when examined.
    AlreadyFinal(IdempotencyRecord),
    /// Lookups failed; the record stays PENDING.
    Ambiguous {
        /// Unresolved key.
        key: IdempotencyKey,
        /// Last lookup failure.
        reason: String,
    },
}

/// Summary of a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    /// PENDING records examined.
    pub examined: usize,
    /// Records resolved to SUCCEEDED.
    pub succeeded: usize,
    /// Records resolved to FAILED.
    pub failed: usize,
    /// Records left PENDING, as `RECONCILIATION_AMBIGUOUS` errors.
    pub ambiguous: Vec<GatewayError>,
}

impl ReconciliationReport {
    /// Whether every examined record reached a final state.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.ambiguous.is_empty()
    }
}

/// Resolves PENDING records against the remote.
pub struct Reconciler<'a> {
    ledger: &'a Ledger,
    lookup: &'a dyn OrderLookup,
    clock: &'a dyn Clock,
    attempts: u32,
    interval: Duration,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler making three lookups two seconds apart.
    #[must_use]
    pub fn new(ledger: &'a Ledger, lookup: &'a dyn OrderLookup, clock: &'a dyn Clock) -> Self {
        Self {
            ledger,
            lookup,
            clock,
            attempts: 3,
            interval: Duration::from_secs(2),
        }
    }

    /// Set the lookup window.
    #[must_use]
    pub fn with_window(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.interval = interval;
        self
    }

    /// Resolve every PENDING record.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or written.
    pub async fn reconcile_pending(&self) -> Result<ReconciliationReport, LedgerError> {
        let pending = self.ledger.pending_records().await?;
        let mut report = ReconciliationReport {
            examined: pending.len(),
            ..ReconciliationReport::default()
        };

        if pending.is_empty() {
            return Ok(report);
        }
        info!(pending = pending.len(), "Reconciling pending orders");

        for record in pending {
            let _guard = self.ledger.lock_key(&record.key).await;
            match self.resolve_locked(&record.key).await? {
                Resolution::Succeeded(_) => report.succeeded += 1,
                Resolution::Failed(_) => report.failed += 1,
                Resolution::AlreadyFinal(_) => {}
                Resolution::Ambiguous { key, reason } => {
                    report.ambiguous.push(GatewayError::ReconciliationAmbiguous {
                        key: key.to_string(),
                        message: reason,
                    });
                }
            }
        }

        info!(
            examined = report.examined,
            succeeded = report.succeeded,
            failed = report.failed,
            ambiguous = report.ambiguous.len(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Resolve one record. The caller must hold the key's lock.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key has no record, or any ledger failure.
    pub async fn resolve_locked(&self, key: &IdempotencyKey) -> Result<Resolution, LedgerError> {
        let record = self
            .ledger
            .get_record(key)
            .await?
            .ok_or_else(|| LedgerError::NotFound(key.to_string()))?;
        if record.status.is_terminal() {
            return Ok(Resolution::AlreadyFinal(record));
        }

        // A single failed lookup means absence was never proven.
        let mut lookup_error: Option<String> = None;
        for attempt in 1..=self.attempts {
            match self.lookup.lookup_order(key).await {
                Ok(LookupResult::Found { remote_order_id }) => {
                    let outcome = Outcome::Succeeded { remote_order_id };
                    let completed = self.finish(&record, &outcome).await?;
                    info!(idempotency_key = %key, attempt, "Pending order found at remote");
                    return Ok(Resolution::Succeeded(completed));
                }
                Ok(LookupResult::NotFound) => {
                    debug!(idempotency_key = %key, attempt, "Order not found at remote");
                }
                Err(e) => {
                    warn!(idempotency_key = %key, attempt, error = %e, "Order lookup failed");
                    lookup_error = Some(e.user_message());
                }
            }
            if attempt < self.attempts {
                self.clock.sleep(self.interval).await;
            }
        }

        if let Some(reason) = lookup_error {
            error!(idempotency_key = %key, reason = %reason, "Order outcome is ambiguous");
            self.ledger
                .log_activity(
                    Severity::Critical,
                    RECONCILIATION_CATEGORY,
                    &format!("order outcome unknown, manual check required: {reason}"),
                    Some(key),
                )
                .await?;
            crate::observability::record_reconciliation_ambiguous();
            return Ok(Resolution::Ambiguous {
                key: key.clone(),
                reason,
            });
        }

        let outcome = Outcome::Failed {
            reason: format!("not found at remote after {} lookup(s)", self.attempts),
        };
        let completed = self.finish(&record, &outcome).await?;
        info!(idempotency_key = %key, "Pending order absent at remote, marked failed");
        Ok(Resolution::Failed(completed))
    }

    async fn finish(
        &self,
        record: &IdempotencyRecord,
        outcome: &Outcome,
    ) -> Result<IdempotencyRecord, LedgerError> {
        let entry = PlaceOrderRequest::from_fingerprint(&record.fingerprint)
            .map(|request| LedgerEntry::for_order(&record.key, action_for_key(&record.key), &request, outcome));
        self.ledger.complete(&record.key, outcome, entry.as_ref()).await
    }
}

/// Ledger action implied by an idempotency key.
#[must_use]
pub fn action_for_key(key: &IdempotencyKey) -> LedgerAction {
    if key.as_str().starts_with(CLOSE_KEY_PREFIX) {
        LedgerAction::Close
    } else {
        LedgerAction::Place
    }
}
