//! Durable ledger: idempotency records, the append-only order log and the
//! operator activity log, plus crash recovery for unresolved orders.

mod key_lock;
mod records;
mod recovery;
mod store;

pub use key_lock::{KeyGuard, KeyLocks};
pub use records::{
    ActivityEntry, BeginOutcome, IdempotencyKey, IdempotencyRecord, IdempotencyStatus,
    LedgerAction, LedgerEntry, Outcome, Severity, TradeSummary,
};
#[cfg(test)]
pub use recovery::MockOrderLookup;
pub use recovery::{
    CLOSE_KEY_PREFIX, LookupResult, OrderLookup, RECONCILIATION_CATEGORY, ReconciliationReport,
    Reconciler, Resolution, action_for_key,
};
pub use store::{Ledger, LedgerError};
