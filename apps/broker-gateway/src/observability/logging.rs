//! Structured logging setup.
//!
//! `RUST_LOG` overrides the configured level when set.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Error type for logging setup.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Configured level is not a valid filter directive.
    #[error("invalid log filter '{0}'")]
    Filter(String),
    /// A global subscriber is already installed.
    #[error("failed to initialize tracing subscriber: {0}")]
    Subscriber(String),
}

/// Build the filter: `RUST_LOG` if set, otherwise the configured level.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|_| LoggingError::Filter(config.level.clone())),
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;

    let result = if config.format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            )
            .try_init()
    };

    result.map_err(|e| LoggingError::Subscriber(e.to_string()))?;
    tracing::info!(level = %config.level, format = %config.format, "Logging initialized");
    Ok(())
}
