//! SQLite-backed durable ledger.
//!
//! Three tables survive restarts:
//!
//! - `idempotency_records`: one row per idempotency key, PENDING until the
//!   outcome is known
//! - `order_ledger`: append-only order/trade log, queryable by date and
//!   instrument
//! - `activity_log`: operator-facing trail of notable events
//!
//! The database runs in WAL mode with `synchronous=NORMAL`. Every
//! multi-statement write runs in a transaction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::key_lock::{KeyGuard, KeyLocks};
use super::records::{
    ActivityEntry, BeginOutcome, IdempotencyKey, IdempotencyRecord, IdempotencyStatus,
    LedgerAction, LedgerEntry, Outcome, Severity, TradeSummary,
};
use crate::config::LedgerSettings;
use crate::gateway::OrderSide;

/// Busy timeout for concurrent writers.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema, applied statement by statement on open.
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS idempotency_records (
        key TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('PENDING', 'SUCCEEDED', 'FAILED')),
        remote_order_id TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_idempotency_status ON idempotency_records (status)",
    r"
    CREATE TABLE IF NOT EXISTS order_ledger (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id TEXT NOT NULL UNIQUE,
        idempotency_key TEXT,
        action TEXT NOT NULL,
        instrument TEXT NOT NULL,
        side TEXT,
        quantity TEXT NOT NULL,
        price TEXT,
        status TEXT NOT NULL,
        remote_order_id TEXT,
        message TEXT,
        recorded_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_order_ledger_recorded_at ON order_ledger (recorded_at)",
    "CREATE INDEX IF NOT EXISTS idx_order_ledger_instrument ON order_ledger (instrument)",
    r"
    CREATE TRIGGER IF NOT EXISTS order_ledger_no_update
    BEFORE UPDATE ON order_ledger
    BEGIN
        SELECT RAISE(ABORT, 'order_ledger is append-only');
    END
    ",
    r"
    CREATE TRIGGER IF NOT EXISTS order_ledger_no_delete
    BEFORE DELETE ON order_ledger
    BEGIN
        SELECT RAISE(ABORT, 'order_ledger is append-only');
    END
    ",
    r"
    CREATE TABLE IF NOT EXISTS activity_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        severity TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        idempotency_key TEXT,
        recorded_at TEXT NOT NULL
    )
    ",
];

const SELECT_RECORD: &str = r"
    SELECT key, fingerprint, status, remote_order_id, error_message, created_at, updated_at
    FROM idempotency_records
    WHERE key = ?1
";

const SELECT_ENTRY_COLUMNS: &str = r"
    SELECT entry_id, idempotency_key, action, instrument, side, quantity, price,
           status, remote_order_id, message, recorded_at
    FROM order_ledger
";

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Query error: {0}")]
    Query(String),

    /// Stored value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data integrity error.
    #[error("Data integrity error: {0}")]
    Integrity(String),

    /// No idempotency record for the key.
    #[error("Idempotency record not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

/// Durable idempotency table and order log.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
    locks: Arc<KeyLocks>,
}

impl Ledger {
    /// Open (creating if needed) the ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub async fn open(path: &str, max_connections: u32) -> Result<Self, LedgerError> {
        if let Some(parent) = std::path::Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::Connection(format!("{}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;

        let ledger = Self::with_pool(pool);
        ledger.migrate().await?;

        info!(path = %path, max_connections, "Ledger opened");
        Ok(ledger)
    }

    /// Open the ledger described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn from_settings(settings: &LedgerSettings) -> Result<Self, LedgerError> {
        Self::open(&settings.db_path, settings.max_connections).await
    }

    /// Open a private in-memory ledger (single connection, lost on drop).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| LedgerError::Connection(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;

        let ledger = Self::with_pool(pool);
        ledger.migrate().await?;
        Ok(ledger)
    }

    fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyLocks::new()),
        }
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Serialize work on `key`. Holders of different keys never block each other.
    pub async fn lock_key(&self, key: &IdempotencyKey) -> KeyGuard {
        self.locks.lock(key.as_str()).await
    }

    // ========================================================================
    // Idempotency
    // ========================================================================

    /// Record an attempt for `key`, or return the existing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn begin(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
    ) -> Result<BeginOutcome, LedgerError> {
        let now = format_ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT INTO idempotency_records (key, fingerprint, status, created_at, updated_at)
            VALUES (?1, ?2, 'PENDING', ?3, ?3)
            ON CONFLICT (key) DO NOTHING
            ",
        )
        .bind(key.as_str())
        .bind(fingerprint)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            crate::observability::record_ledger_record(IdempotencyStatus::Pending);
            debug!(idempotency_key = %key, "Idempotency record created");
            return Ok(BeginOutcome::Fresh);
        }

        let row = sqlx::query(SELECT_RECORD)
            .bind(key.as_str())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let existing = record_from_row(&row)?;
        debug!(idempotency_key = %key, status = %existing.status, "Idempotency record exists");
        Ok(BeginOutcome::Duplicate(existing))
    }

    /// Finalize a PENDING record and, in the same transaction, append
    /// `entry` to the order log.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key has no record and `Integrity` if the
    /// record is already final.
    pub async fn complete(
        &self,
        key: &IdempotencyKey,
        outcome: &Outcome,
        entry: Option<&LedgerEntry>,
    ) -> Result<IdempotencyRecord, LedgerError> {
        let (remote_order_id, error_message) = match outcome {
            Outcome::Succeeded { remote_order_id } => (Some(remote_order_id.as_str()), None),
            Outcome::Failed { reason } => (None, Some(reason.as_str())),
        };
        let status = outcome.status();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE idempotency_records
            SET status = ?2, remote_order_id = ?3, error_message = ?4, updated_at = ?5
            WHERE key = ?1 AND status = 'PENDING'
            ",
        )
        .bind(key.as_str())
        .bind(status.as_str())
        .bind(remote_order_id)
        .bind(error_message)
        .bind(format_ts(Utc::now()))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let existing = sqlx::query(SELECT_RECORD)
                .bind(key.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            return match existing {
                None => Err(LedgerError::NotFound(key.to_string())),
                Some(row) => {
                    let record = record_from_row(&row)?;
                    Err(LedgerError::Integrity(format!(
                        "record '{key}' is already {}",
                        record.status
                    )))
                }
            };
        }

        if let Some(entry) = entry {
            insert_entry(&mut *tx, entry).await?;
        }

        let row = sqlx::query(SELECT_RECORD)
            .bind(key.as_str())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        crate::observability::record_ledger_record(status);
        info!(idempotency_key = %key, status = %status, "Idempotency record completed");
        record_from_row(&row)
    }

    /// Fetch the record for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// All PENDING records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn pending_records(&self) -> Result<Vec<IdempotencyRecord>, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT key, fingerprint, status, remote_order_id, error_message, created_at, updated_at
            FROM idempotency_records
            WHERE status = 'PENDING'
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Delete finished records last updated before `older_than` ago.
    /// PENDING records are never removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn expire_completed(&self, older_than: chrono::Duration) -> Result<u64, LedgerError> {
        let cutoff = format_ts(Utc::now() - older_than);
        let removed = sqlx::query(
            "DELETE FROM idempotency_records WHERE status != 'PENDING' AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed > 0 {
            info!(removed, "Expired completed idempotency records");
        }
        Ok(removed)
    }

    // ========================================================================
    // Order ledger
    // ========================================================================

    /// Append an entry. Returns `false` if `entry_id` was already recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn append_entry(&self, entry: &LedgerEntry) -> Result<bool, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        insert_entry(&mut *conn, entry).await
    }

    /// Entries recorded in `[from, to)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn trades_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            "{SELECT_ENTRY_COLUMNS} WHERE recorded_at >= ?1 AND recorded_at < ?2 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(format_ts(from))
            .bind(format_ts(to))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Entries for one instrument, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn trades_for_instrument(
        &self,
        instrument: &str,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!("{SELECT_ENTRY_COLUMNS} WHERE instrument = ?1 ORDER BY seq ASC");
        let rows = sqlx::query(&sql)
            .bind(instrument)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Most recent entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_trades(&self, limit: u32) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!("{SELECT_ENTRY_COLUMNS} ORDER BY seq DESC LIMIT ?1");
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Count and notionals of successful placements and closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored decimal is corrupt.
    pub async fn trade_summary(&self) -> Result<TradeSummary, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT side, quantity, price
            FROM order_ledger
            WHERE status = 'SUCCEEDED' AND action IN ('PLACE', 'CLOSE')
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = TradeSummary::default();
        for row in &rows {
            summary.trade_count += 1;
            let side: Option<String> = row.try_get("side")?;
            let quantity = parse_decimal(&row.try_get::<String, _>("quantity")?)?;
            let price: Option<String> = row.try_get("price")?;
            let Some(price) = price.as_deref().map(parse_decimal).transpose()? else {
                continue;
            };
            match side.as_deref().and_then(OrderSide::parse) {
                Some(OrderSide::Buy) => summary.bought_notional += quantity * price,
                Some(OrderSide::Sell) => summary.sold_notional += quantity * price,
                None => {}
            }
        }
        Ok(summary)
    }

    // ========================================================================
    // Activity log
    // ========================================================================

    /// Write an activity row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn log_activity(
        &self,
        severity: Severity,
        category: &str,
        message: &str,
        idempotency_key: Option<&IdempotencyKey>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r"
            INSERT INTO activity_log (severity, category, message, idempotency_key, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(severity.as_str())
        .bind(category)
        .bind(crate::error::redact(message))
        .bind(idempotency_key.map(IdempotencyKey::as_str))
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent activity rows, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityEntry>, LedgerError> {
        let rows = sqlx::query(
            r"
            SELECT id, severity, category, message, idempotency_key, recorded_at
            FROM activity_log
            ORDER BY id DESC
            LIMIT ?1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ActivityEntry, LedgerError> {
                let severity: String = row.try_get("severity")?;
                Ok(ActivityEntry {
                    id: row.try_get("id")?,
                    severity: Severity::parse(&severity).ok_or_else(|| {
                        LedgerError::Serialization(format!("unknown severity '{severity}'"))
                    })?,
                    category: row.try_get("category")?,
                    message: row.try_get("message")?,
                    idempotency_key: row.try_get("idempotency_key")?,
                    recorded_at: parse_ts(&row.try_get::<String, _>("recorded_at")?)?,
                })
            })
            .collect()
    }
}

// ============================================================================
// Row mapping
// ============================================================================

async fn insert_entry(conn: &mut SqliteConnection, entry: &LedgerEntry) -> Result<bool, LedgerError> {
    let inserted = sqlx::query(
        r"
        INSERT OR IGNORE INTO order_ledger (
            entry_id, idempotency_key, action, instrument, side, quantity, price,
            status, remote_order_id, message, recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ",
    )
    .bind(&entry.entry_id)
    .bind(entry.idempotency_key.as_deref())
    .bind(entry.action.as_str())
    .bind(&entry.instrument)
    .bind(entry.side.map(|s| s.as_str()))
    .bind(entry.quantity.to_string())
    .bind(entry.price.map(|p| p.to_string()))
    .bind(entry.status.as_str())
    .bind(entry.remote_order_id.as_deref())
    .bind(entry.message.as_deref())
    .bind(format_ts(entry.recorded_at))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted == 0 {
        warn!(entry_id = %entry.entry_id, "Ledger entry already recorded");
    }
    Ok(inserted == 1)
}

fn record_from_row(row: &SqliteRow) -> Result<IdempotencyRecord, LedgerError> {
    let status: String = row.try_get("status")?;
    Ok(IdempotencyRecord {
        key: IdempotencyKey::new(row.try_get::<String, _>("key")?),
        fingerprint: row.try_get("fingerprint")?,
        status: IdempotencyStatus::parse(&status)
            .ok_or_else(|| LedgerError::Serialization(format!("unknown status '{status}'")))?,
        remote_order_id: row.try_get("remote_order_id")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, LedgerError> {
    let action: String = row.try_get("action")?;
    let status: String = row.try_get("status")?;
    let side: Option<String> = row.try_get("side")?;
    let price: Option<String> = row.try_get("price")?;

    Ok(LedgerEntry {
        entry_id: row.try_get("entry_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        action: LedgerAction::parse(&action)
            .ok_or_else(|| LedgerError::Serialization(format!("unknown action '{action}'")))?,
        instrument: row.try_get("instrument")?,
        side: side.as_deref().and_then(OrderSide::parse),
        quantity: parse_decimal(&row.try_get::<String, _>("quantity")?)?,
        price: price.as_deref().map(parse_decimal).transpose()?,
        status: IdempotencyStatus::parse(&status)
            .ok_or_else(|| LedgerError::Serialization(format!("unknown status '{status}'")))?,
        remote_order_id: row.try_get("remote_order_id")?,
        message: row.try_get("message")?,
        recorded_at: parse_ts(&row.try_get::<String, _>("recorded_at")?)?,
    })
}

/// Fixed-width UTC timestamp so text ordering matches time ordering.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::Serialization(format!("bad timestamp '{value}': {e}")))
}

fn parse_decimal(value: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(value)
        .map_err(|e| LedgerError::Serialization(format!("bad decimal '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn entry(id: &str, instrument: &str, side: OrderSide, qty: Decimal, price: Decimal) -> LedgerEntry {
        LedgerEntry {
            entry_id: id.to_string(),
            idempotency_key: Some(id.to_string()),
            action: LedgerAction::Place,
            instrument: instrument.to_string(),
            side: Some(side),
            quantity: qty,
            price: Some(price),
            status: IdempotencyStatus::Succeeded,
            remote_order_id: Some(format!("R-{id}")),
            message: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_begin_is_fresh_then_duplicate() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let key = IdempotencyKey::new("k1");

        assert_eq!(ledger.begin(&key, "a=1").await.unwrap(), BeginOutcome::Fresh);

        let BeginOutcome::Duplicate(record) = ledger.begin(&key, "a=1").await.unwrap() else {
            panic!("expected duplicate");
        };
        assert_eq!(record.status, IdempotencyStatus::Pending);
        assert_eq!(record.fingerprint, "a=1");
    }

    #[tokio::test]
    async fn test_complete_transitions_and_appends_entry() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let key = IdempotencyKey::new("k1");
        ledger.begin(&key, "a=1").await.unwrap();

        let outcome = Outcome::Succeeded {
            remote_order_id: "R-k1".to_string(),
        };
        let e = entry("k1", "NIFTY", OrderSide::Buy, dec!(50), dec!(100));
        let record = ledger.complete(&key, &outcome, Some(&e)).await.unwrap();

        assert_eq!(record.status, IdempotencyStatus::Succeeded);
        assert_eq!(record.remote_order_id.as_deref(), Some("R-k1"));
        assert_eq!(ledger.trades_for_instrument("NIFTY").await.unwrap(), vec![e]);
        assert!(ledger.pending_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_twice_is_integrity_error() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let key = IdempotencyKey::new("k1");
        ledger.begin(&key, "a=1").await.unwrap();

        let failed = Outcome::Failed {
            reason: "rejected".to_string(),
        };
        ledger.complete(&key, &failed, None).await.unwrap();

        let err = ledger.complete(&key, &failed, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Integrity(_)));

        let missing = IdempotencyKey::new("nope");
        let err = ledger.complete(&missing, &failed, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_complete_rolls_back_entry() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let key = IdempotencyKey::new("missing");
        let e = entry("missing", "NIFTY", OrderSide::Buy, dec!(1), dec!(1));

        let outcome = Outcome::Succeeded {
            remote_order_id: "R".to_string(),
        };
        assert!(ledger.complete(&key, &outcome, Some(&e)).await.is_err());
        assert!(ledger.recent_trades(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_entry_is_deduplicated() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let e = entry("e1", "BANKNIFTY", OrderSide::Sell, dec!(25), dec!(200));

        assert!(ledger.append_entry(&e).await.unwrap());
        assert!(!ledger.append_entry(&e).await.unwrap());
        assert_eq!(ledger.recent_trades(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trade_summary_and_queries() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        ledger
            .append_entry(&entry("e1", "NIFTY", OrderSide::Buy, dec!(2), dec!(100)))
            .await
            .unwrap();
        ledger
            .append_entry(&entry("e2", "NIFTY", OrderSide::Sell, dec!(1), dec!(110)))
            .await
            .unwrap();
        let mut rejected = entry("e3", "NIFTY", OrderSide::Buy, dec!(9), dec!(9));
        rejected.status = IdempotencyStatus::Failed;
        ledger.append_entry(&rejected).await.unwrap();

        let summary = ledger.trade_summary().await.unwrap();
        assert_eq!(summary.trade_count, 2);
        assert_eq!(summary.bought_notional, dec!(200));
        assert_eq!(summary.sold_notional, dec!(110));

        let recent = ledger.recent_trades(2).await.unwrap();
        assert_eq!(recent[0].entry_id, "e3");
        assert_eq!(recent[1].entry_id, "e2");

        let window = ledger
            .trades_between(
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(window.len(), 3);

        let none = ledger
            .trades_between(
                Utc::now() - chrono::Duration::hours(2),
                Utc::now() - chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_activity_log_is_redacted() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        ledger
            .log_activity(Severity::Critical, "RECONCILIATION", "lookup failed api_key=abc", None)
            .await
            .unwrap();
        ledger
            .log_activity(Severity::Info, "ORDER", "placed", Some(&IdempotencyKey::new("k")))
            .await
            .unwrap();

        let rows = ledger.recent_activity(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].category, "ORDER");
        assert_eq!(rows[0].idempotency_key.as_deref(), Some("k"));
        assert_eq!(rows[1].severity, Severity::Critical);
        assert!(!rows[1].message.contains("abc"));
    }

    #[tokio::test]
    async fn test_expire_completed_keeps_pending() {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let done = IdempotencyKey::new("done");
        let open = IdempotencyKey::new("open");
        ledger.begin(&done, "x").await.unwrap();
        ledger.begin(&open, "y").await.unwrap();
        ledger
            .complete(&done, &Outcome::Failed { reason: "no".to_string() }, None)
            .await
            .unwrap();

        let removed = ledger
            .expire_completed(chrono::Duration::seconds(-60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(ledger.get_record(&done).await.unwrap().is_none());
        assert!(ledger.get_record(&open).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let path = path.to_str().unwrap();
        let key = IdempotencyKey::new("persist");

        let ledger = Ledger::open(path, 2).await.unwrap();
        ledger.begin(&key, "a=1").await.unwrap();
        ledger.close().await;

        let reopened = Ledger::open(path, 2).await.unwrap();
        let pending = reopened.pending_records().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, key);
    }
}
