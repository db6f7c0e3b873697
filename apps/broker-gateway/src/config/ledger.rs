//! Ledger persistence and reconciliation configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::gateway::default_true;

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Remote lookups per PENDING record during reconciliation.
    #[serde(default = "default_lookup_attempts")]
    pub lookup_attempts: u32,
    /// Spacing between reconciliation lookups (milliseconds).
    #[serde(default = "default_lookup_interval_ms")]
    pub lookup_interval_ms: u64,
    /// Reconcile PENDING records when the process starts.
    #[serde(default = "default_true")]
    pub reconcile_on_startup: bool,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
            lookup_attempts: default_lookup_attempts(),
            lookup_interval_ms: default_lookup_interval_ms(),
            reconcile_on_startup: true,
        }
    }
}

impl LedgerSettings {
    /// Lookup spacing as a duration.
    #[must_use]
    pub const fn lookup_interval(&self) -> Duration {
        Duration::from_millis(self.lookup_interval_ms)
    }
}

fn default_db_path() -> String {
    "./data/ledger.db".to_string()
}

const fn default_max_connections() -> u32 {
    4
}

const fn default_lookup_attempts() -> u32 {
    3
}

const fn default_lookup_interval_ms() -> u64 {
    2_000
}
