//! Risk monitor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::gateway::default_true;

/// Risk monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Whether the binary starts the monitor.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between evaluation cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Alerts retained in history.
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
    /// Seconds to wait for the loop to exit on stop.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            alert_capacity: default_alert_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl MonitorSettings {
    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Shutdown grace as a duration.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

const fn default_poll_interval_secs() -> u64 {
    15
}

const fn default_alert_capacity() -> usize {
    50
}

const fn default_shutdown_grace_secs() -> u64 {
    5
}
