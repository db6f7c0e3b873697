//! Bounded alert history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ledger::Severity;
use crate::observability::record_monitor_alert;

/// Alert category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCategory {
    /// A stop rule fired.
    StopLoss,
    /// Price or position data could not be fetched.
    PriceFetch,
    /// A protective close was placed, failed or is unresolved.
    Order,
    /// Position lifecycle (e.g. closed elsewhere).
    Position,
}

impl AlertCategory {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "STOP_LOSS",
            Self::PriceFetch => "PRICE_FETCH",
            Self::Order => "ORDER",
            Self::Position => "POSITION",
        }
    }
}

/// Operator-facing alert raised by the risk monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Position the alert concerns.
    pub position_key: String,
    /// Severity.
    pub severity: Severity,
    /// Category.
    pub category: AlertCategory,
    /// Message.
    pub message: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Alert stamped now.
    #[must_use]
    pub fn new(
        position_key: impl Into<String>,
        severity: Severity,
        category: AlertCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            position_key: position_key.into(),
            severity,
            category,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Most-recent-first alert history holding at most `capacity` alerts.
#[derive(Debug)]
pub struct AlertLog {
    capacity: usize,
    alerts: Mutex<VecDeque<Alert>>,
}

impl AlertLog {
    /// Create an empty log. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            alerts: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record an alert, evicting the oldest when full.
    pub fn push(&self, alert: Alert) {
        match alert.severity {
            Severity::Info => info!(
                position_key = %alert.position_key,
                category = alert.category.as_str(),
                message = %alert.message,
                "Monitor alert"
            ),
            Severity::Warning => warn!(
                position_key = %alert.position_key,
                category = alert.category.as_str(),
                message = %alert.message,
                "Monitor alert"
            ),
            Severity::Critical => error!(
                position_key = %alert.position_key,
                category = alert.category.as_str(),
                message = %alert.message,
                "Monitor alert"
            ),
        }
        record_monitor_alert(alert.severity);

        let mut alerts = self.alerts.lock();
        alerts.push_front(alert);
        alerts.truncate(self.capacity);
    }

    /// Alerts newer than `since` (all when `None`), most recent first.
    #[must_use]
    pub fn since(&self, since: Option<DateTime<Utc>>) -> Vec<Alert> {
        let alerts = self.alerts.lock();
        alerts
            .iter()
            .filter(|a| since.is_none_or(|ts| a.timestamp > ts))
            .cloned()
            .collect()
    }

    /// Retained alert count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    /// Whether no alerts are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }

    /// Retention limit.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
