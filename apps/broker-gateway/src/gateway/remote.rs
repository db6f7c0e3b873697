//! Port to the remote brokerage API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::resilience::{FailureClass, classify_message, classify_status};

/// Answer from the remote, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReply {
    /// HTTP-style status code.
    pub status: u16,
    /// Response body.
    pub payload: Value,
}

impl RemoteReply {
    /// 200 reply.
    #[must_use]
    pub const fn ok(payload: Value) -> Self {
        Self {
            status: 200,
            payload,
        }
    }

    /// Reply with an error status and a `message` body.
    #[must_use]
    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            payload: serde_json::json!({ "message": message }),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Error text carried by the body, if any.
    #[must_use]
    pub fn error_message(&self) -> String {
        ["message", "error", "Error"]
            .iter()
            .find_map(|field| self.payload.get(*field).and_then(Value::as_str))
            .map_or_else(|| format!("remote returned status {}", self.status), str::to_string)
    }
}

/// Failure to obtain any reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteFailure {
    /// No reply within the call timeout.
    #[error("request timed out")]
    Timeout,
    /// Connection dropped mid-request.
    #[error("connection reset")]
    ConnectionReset,
    /// Remote refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// Name resolution failed.
    #[error("dns resolution failed: {0}")]
    Dns(String),
    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

impl RemoteFailure {
    /// Retry classification.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::ConnectionReset | Self::ConnectionRefused | Self::Dns(_) => {
                FailureClass::Transient
            }
            Self::Other(message) => classify_message(message),
        }
    }
}

/// Classify a non-2xx reply. Status wins; the body text decides only when
/// the status is not itself conclusive.
#[must_use]
pub fn classify_reply(reply: &RemoteReply) -> FailureClass {
    match reply.status {
        400..=599 => classify_status(reply.status),
        _ => classify_message(&reply.error_message()),
    }
}

/// Remote brokerage API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Invoke `endpoint` with `params`.
    ///
    /// A reply with any status is `Ok`; `Err` means no reply was obtained.
    async fn call(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<RemoteReply, RemoteFailure>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case(RemoteFailure::Timeout, FailureClass::Transient ; "timeout")]
    #[test_case(RemoteFailure::ConnectionReset, FailureClass::Transient ; "reset")]
    #[test_case(RemoteFailure::Dns("no such host".into()), FailureClass::Transient ; "dns")]
    #[test_case(RemoteFailure::Other("Invalid session".into()), FailureClass::Permanent ; "invalid session")]
    #[test_case(RemoteFailure::Other("socket hiccup".into()), FailureClass::Transient ; "unknown")]
    fn test_failure_class(failure: RemoteFailure, expected: FailureClass) {
        assert_eq!(failure.class(), expected);
    }

    #[test]
    fn test_reply_classification() {
        assert_eq!(classify_reply(&RemoteReply::error(503, "busy")), FailureClass::Transient);
        assert_eq!(classify_reply(&RemoteReply::error(401, "bad key")), FailureClass::Permanent);
        assert_eq!(classify_reply(&RemoteReply::error(429, "slow down")), FailureClass::Transient);
    }

    #[test]
    fn test_error_message_fallbacks() {
        let reply = RemoteReply {
            status: 500,
            payload: json!({"error": "upstream"}),
        };
        assert_eq!(reply.error_message(), "upstream");

        let bare = RemoteReply {
            status: 502,
            payload: Value::Null,
        };
        assert_eq!(bare.error_message(), "remote returned status 502");
        assert!(!bare.is_success());
        assert!(RemoteReply::ok(Value::Null).is_success());
    }
}
