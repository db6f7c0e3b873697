//! Error taxonomy for the broker gateway.
//!
//! Every failure that leaves the gateway is a [`GatewayError`] and maps to a
//! stable [`ErrorCode`] whose reason string is what consumers see in
//! responses.
//!
//! | Code | Retried internally | Meaning |
//! |------|--------------------|---------|
//! | `RATE_LIMIT_TIMEOUT` | no | No rate token within the wait budget |
//! | `CIRCUIT_OPEN` | no | Breaker is shedding load |
//! | `TRANSIENT_REMOTE_ERROR` | yes, until exhausted | Timeout, reset, 408/429/5xx |
//! | `PERMANENT_REMOTE_ERROR` | no | Bad input or credentials |
//! | `DUPLICATE_REQUEST` | no | Idempotency key already completed |
//! | `PERSISTENCE_ERROR` | no | Ledger write or read failed |
//! | `RECONCILIATION_AMBIGUOUS` | no | Order outcome unknown, operator action needed |
//! | `IDEMPOTENCY_CONFLICT` | no | Key reused with a different request |
//! | `INVALID_REQUEST` | no | Local validation failed |

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::resilience::{CircuitOpen, RateLimitTimeout};

/// Error codes exposed to gateway consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No rate token could be obtained in time.
    RateLimitTimeout,
    /// Circuit breaker rejected the call.
    CircuitOpen,
    /// Transient remote failure that survived every retry.
    TransientRemoteError,
    /// Remote rejected the request; retrying will not help.
    PermanentRemoteError,
    /// Idempotency key already has a completed outcome.
    DuplicateRequest,
    /// Durable store failure.
    PersistenceError,
    /// Order outcome could not be determined.
    ReconciliationAmbiguous,
    /// Idempotency key reused with different request parameters.
    IdempotencyConflict,
    /// Request failed local validation.
    InvalidRequest,
}

impl ErrorCode {
    /// Get the error reason string.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::RateLimitTimeout => "RATE_LIMIT_TIMEOUT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::TransientRemoteError => "TRANSIENT_REMOTE_ERROR",
            Self::PermanentRemoteError => "PERMANENT_REMOTE_ERROR",
            Self::DuplicateRequest => "DUPLICATE_REQUEST",
            Self::PersistenceError => "PERSISTENCE_ERROR",
            Self::ReconciliationAmbiguous => "RECONCILIATION_AMBIGUOUS",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }

    /// Whether submitting the same request again later can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitTimeout | Self::CircuitOpen | Self::TransientRemoteError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// Failure of a gateway operation.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No rate token within the acquire timeout.
    #[error("{0}")]
    RateLimitTimeout(#[from] RateLimitTimeout),

    /// Circuit breaker rejected the call.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpen),

    /// Transient failure after all attempts were used.
    #[error("transient remote error on '{endpoint}' after {attempts} attempt(s): {message}")]
    TransientRemote {
        /// Remote endpoint.
        endpoint: String,
        /// Attempts made.
        attempts: u32,
        /// Last HTTP status, if the remote answered.
        status: Option<u16>,
        /// Last failure message.
        message: String,
    },

    /// Remote rejected the request.
    #[error("permanent remote error on '{endpoint}': {message}")]
    PermanentRemote {
        /// Remote endpoint.
        endpoint: String,
        /// HTTP status, if the remote answered.
        status: Option<u16>,
        /// Failure message.
        message: String,
    },

    /// Durable store failure.
    #[error("persistence failure: {message}")]
    Persistence {
        /// Failure message.
        message: String,
    },

    /// Outcome of an earlier attempt is unknown.
    #[error("outcome for idempotency key '{key}' is unresolved: {message}")]
    ReconciliationAmbiguous {
        /// Idempotency key.
        key: String,
        /// Failure message.
        message: String,
    },

    /// Key reused with a different request fingerprint.
    #[error("idempotency key '{key}' was already used for a different request")]
    IdempotencyConflict {
        /// Idempotency key.
        key: String,
    },

    /// Local validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Stable error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RateLimitTimeout(_) => ErrorCode::RateLimitTimeout,
            Self::CircuitOpen(_) => ErrorCode::CircuitOpen,
            Self::TransientRemote { .. } => ErrorCode::TransientRemoteError,
            Self::PermanentRemote { .. } => ErrorCode::PermanentRemoteError,
            Self::Persistence { .. } => ErrorCode::PersistenceError,
            Self::ReconciliationAmbiguous { .. } => ErrorCode::ReconciliationAmbiguous,
            Self::IdempotencyConflict { .. } => ErrorCode::IdempotencyConflict,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
        }
    }

    /// Message safe to show outside the process.
    #[must_use]
    pub fn user_message(&self) -> String {
        redact(&self.to_string())
    }

    /// Invalid request.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

impl From<LedgerError> for GatewayError {
    fn from(err: LedgerError) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}

/// Mask credential values in free text.
///
/// Handles `key=value`, `key: value` and JSON `"key": "value"` forms for
/// `api_key`, `api_secret`, `secret`, `session_token`, `password`, `token`
/// and `authorization` (including a `Bearer` prefix).
#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
#[must_use]
pub fn redact(input: &str) -> String {
    static SECRET_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = SECRET_REGEX.get_or_init(|| {
        regex::Regex::new(
            r#"(?i)(\b(?:api_key|api_secret|session_token|secret|password|token|authorization)"?\s*[:=]\s*"?)(?:bearer\s+)?[^"&,;\s}]+"#,
        )
        .expect("redaction regex is valid")
    });

    re.replace_all(input, "${1}***").into_owned()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::resilience::CircuitBreakerState;

    #[test]
    fn test_error_code_reasons() {
        assert_eq!(ErrorCode::RateLimitTimeout.reason(), "RATE_LIMIT_TIMEOUT");
        assert_eq!(
            ErrorCode::ReconciliationAmbiguous.to_string(),
            "RECONCILIATION_AMBIGUOUS"
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::PermanentRemoteError).unwrap(),
            "\"PERMANENT_REMOTE_ERROR\""
        );
    }

    #[test]
    fn test_duplicate_code_reason() {
        assert_eq!(ErrorCode::DuplicateRequest.reason(), "DUPLICATE_REQUEST");
        assert!(!ErrorCode::DuplicateRequest.is_retryable());
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::CircuitOpen.is_retryable());
        assert!(ErrorCode::TransientRemoteError.is_retryable());
        assert!(!ErrorCode::PermanentRemoteError.is_retryable());
        assert!(!ErrorCode::IdempotencyConflict.is_retryable());
    }

    #[test]
    fn test_gateway_error_codes() {
        let open = GatewayError::from(CircuitOpen {
            name: "breeze".to_string(),
            state: CircuitBreakerState::Open,
            retry_after: Some(Duration::from_secs(3)),
        });
        assert_eq!(open.code(), ErrorCode::CircuitOpen);
        assert_eq!(open.to_string(), "circuit 'breeze' is OPEN");

        let limited = GatewayError::from(RateLimitTimeout {
            requested: 2,
            timeout_ms: 100,
        });
        assert_eq!(limited.code(), ErrorCode::RateLimitTimeout);

        let persistence = GatewayError::from(LedgerError::Integrity("bad row".to_string()));
        assert_eq!(persistence.code(), ErrorCode::PersistenceError);
    }

    #[test]
    fn test_redact_masks_credentials() {
        let raw = r#"login failed api_key=abc123&user=me password: hunter2 {"session_token": "s3cr3t"} Authorization: Bearer xyz"#;
        let clean = redact(raw);

        assert!(!clean.contains("abc123"));
        assert!(!clean.contains("hunter2"));
        assert!(!clean.contains("s3cr3t"));
        assert!(!clean.contains("xyz"));
        assert!(clean.contains("user=me"));
        assert!(clean.contains("api_key=***"));
    }

    #[test]
    fn test_user_message_is_redacted() {
        let err = GatewayError::PermanentRemote {
            endpoint: "customer_details".to_string(),
            status: Some(401),
            message: "Invalid session token=deadbeef".to_string(),
        };
        let message = err.user_message();
        assert!(message.contains("token=***"));
        assert!(!message.contains("deadbeef"));
    }
}
