//! Configuration module for the broker gateway.
//!
//! Provides configuration loading, validation, and environment variable
//! interpolation for the gateway pipeline, ledger, risk monitor and
//! observability.
//!
//! # Usage
//!
//! ```rust,ignore
//! use broker_gateway::config::{Config, load_config};
//!
//! // Load from default path (config.yaml)
//! let config = load_config(None)?;
//!
//! // Access configuration values
//! println!("bucket capacity: {}", config.rate_limit.capacity);
//! ```

mod gateway;
mod ledger;
mod monitor;
mod observability;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gateway::{
    CacheSettings, CircuitBreakerSettings, RateLimitSettings, RemoteSettings, RetrySettings,
};
pub use ledger::LedgerSettings;
pub use monitor::MonitorSettings;
pub use observability::{LoggingConfig, MetricsSettings, ObservabilityConfig};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Slowest accepted refill rate: one token per hour.
pub const MIN_REFILL_PER_SECOND: f64 = 1.0 / 3600.0;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Token bucket configuration.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Circuit breaker configuration.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Response cache configuration.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Remote call configuration.
    #[serde(default)]
    pub remote: RemoteSettings,
    /// Ledger configuration.
    #[serde(default)]
    pub ledger: LedgerSettings,
    /// Risk monitor configuration.
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================
// Configuration Loading
// ============================================

/// Load configuration from a YAML file with environment variable interpolation.
///
/// # Arguments
///
/// * `path` - Optional path to the config file. Defaults to "config.yaml".
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or(DEFAULT_CONFIG_PATH);

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration, falling back to defaults when the file does not exist.
///
/// # Errors
///
/// Returns a `ConfigError` if an existing file cannot be read, parsed, or validated.
pub fn load_config_or_default(path: Option<&str>) -> Result<Config, ConfigError> {
    match load_config(path) {
        Err(ConfigError::ReadError { path, source })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            tracing::info!(path = %path, "Config file not found, using defaults");
            let config = Config::default();
            validate_config(&config)?;
            Ok(config)
        }
        other => other,
    }
}

/// Load configuration from a YAML string (useful for testing).
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map_or("", |m| m.as_str());
        match cap.get(1).map(|m| std::env::var(m.as_str())) {
            Some(Ok(v)) if !v.is_empty() => v,
            _ => default_value.to_string(),
        }
    })
    .into_owned()
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

    if config.rate_limit.capacity == 0 {
        return fail("rate_limit.capacity must be positive");
    }
    let refill = config.rate_limit.refill_per_second;
    if !refill.is_finite() || refill < MIN_REFILL_PER_SECOND {
        return fail("rate_limit.refill_per_second must be at least one token per hour");
    }
    if config.circuit_breaker.failure_threshold == 0 {
        return fail("circuit_breaker.failure_threshold must be positive");
    }
    if config.retry.max_attempts == 0 {
        return fail("retry.max_attempts must be at least 1");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return fail("retry.base_delay_ms must not exceed retry.max_delay_ms");
    }
    if config.cache.max_entries == 0 {
        return fail("cache.max_entries must be positive");
    }
    if config.remote.call_timeout_ms == 0 {
        return fail("remote.call_timeout_ms must be positive");
    }
    if config.ledger.lookup_attempts == 0 {
        return fail("ledger.lookup_attempts must be at least 1");
    }
    if config.monitor.alert_capacity == 0 {
        return fail("monitor.alert_capacity must be positive");
    }
    if config.monitor.poll_interval_secs == 0 {
        return fail("monitor.poll_interval_secs must be positive");
    }

    let valid_formats = ["json", "pretty"];
    if !valid_formats.contains(&config.observability.logging.format.as_str()) {
        return Err(ConfigError::ValidationError(format!(
            "observability.logging.format must be one of: {valid_formats:?}"
        )));
    }

    if config.observability.metrics.enabled
        && config
            .observability
            .metrics
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        return fail("observability.metrics.listen_addr must be a socket address");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.rate_limit.capacity, 10);
        assert!((config.rate_limit.refill_per_second - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cache.quote, 5);
        assert_eq!(config.cache.funds, 60);
        assert_eq!(config.monitor.poll_interval_secs, 15);
        assert_eq!(config.monitor.alert_capacity, 50);
        assert_eq!(config.observability.logging.format, "json");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_partial_config() {
        let yaml = r"
rate_limit:
  capacity: 20
cache:
  quote: 2
";

        let config = match load_config_from_string(yaml) {
            Ok(c) => c,
            Err(e) => panic!("should load partial config: {e}"),
        };
        assert_eq!(config.rate_limit.capacity, 20);
        assert!((config.rate_limit.refill_per_second - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.cache.quote, 2);
        assert_eq!(config.cache.option_chain, 30);
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let yaml = include_str!("../../config.example.yaml");
        let config = load_config_from_string(yaml).unwrap();
        let defaults = Config::default();

        assert_eq!(config.rate_limit.capacity, defaults.rate_limit.capacity);
        assert_eq!(config.retry.max_delay_ms, defaults.retry.max_delay_ms);
        assert_eq!(config.cache.customer, defaults.cache.customer);
        assert_eq!(config.ledger.lookup_attempts, defaults.ledger.lookup_attempts);
        assert_eq!(config.monitor.alert_capacity, defaults.monitor.alert_capacity);
        assert_eq!(config.observability.metrics.listen_addr, "0.0.0.0:9090");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = load_config_from_string("{}").unwrap();
        assert_eq!(config.ledger.db_path, "./data/ledger.db");
        assert!(config.ledger.reconcile_on_startup);
    }

    #[test]
    fn test_env_var_with_default_when_missing() {
        let input = "db_path: ${BROKER_GATEWAY_TEST_NONEXISTENT_VAR:-/tmp/ledger.db}";
        assert_eq!(interpolate_env_vars(input), "db_path: /tmp/ledger.db");
    }

    #[test]
    fn test_env_var_without_default_becomes_empty() {
        let input = "level: ${BROKER_GATEWAY_TEST_UNLIKELY_TO_EXIST}";
        assert_eq!(interpolate_env_vars(input), "level: ");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)] // ${...} is env var syntax, not format args
    fn test_env_var_uses_existing_value() {
        let input = "path: ${PATH:-default}";
        let result = interpolate_env_vars(input);
        assert_ne!(result, "path: default");
        assert!(result.starts_with("path: "));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let Err(err) = load_config_from_string("rate_limit:\n  capacity: 0\n") else {
            panic!("expected error for zero capacity");
        };
        assert!(err.to_string().contains("rate_limit.capacity"));
    }

    #[test]
    fn test_validation_rejects_vanishing_refill_rate() {
        let Err(err) = load_config_from_string("rate_limit:\n  refill_per_second: 1e-20\n") else {
            panic!("expected error for tiny refill rate");
        };
        assert!(err.to_string().contains("rate_limit.refill_per_second"));
        assert!(load_config_from_string("rate_limit:\n  refill_per_second: 0.001\n").is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_delays() {
        let yaml = "retry:\n  base_delay_ms: 5000\n  max_delay_ms: 100\n";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for inverted delays");
        };
        assert!(err.to_string().contains("base_delay_ms"));
    }

    #[test]
    fn test_validation_rejects_unknown_log_format() {
        let yaml = "observability:\n  logging:\n    format: xml\n";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for log format");
        };
        assert!(err.to_string().contains("logging.format"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let config = load_config_or_default(path.to_str()).unwrap();
        assert_eq!(config.rate_limit.capacity, 10);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "monitor:\n  poll_interval_secs: 3\n").unwrap();

        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.monitor.poll_interval_secs, 3);
    }

    #[test]
    fn test_settings_conversions() {
        let config = Config::default();
        let breaker = config.circuit_breaker.to_resilience_config();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.recovery_timeout.as_secs(), 60);

        let retry = config.retry.to_policy();
        assert_eq!(retry.base_delay.as_millis(), 500);
        assert!(retry.jitter);
    }
}
