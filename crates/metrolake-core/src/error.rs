//! Error taxonomy for the ingestion pipeline
//!
//! Every error that can abort a partition job knows whether it is worth
//! retrying ([`Retryable`]). Per-record errors ([`CoercionError`]) never
//! abort a partition; they are counted in the quality report instead.

use thiserror::Error;

use crate::retry::Retryable;

/// Failure raised by a source adapter.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Upstream unreachable, throttled or timed out. Retry with backoff.
    #[error("{source_name}: source unavailable: {message}")]
    Unavailable {
        source_name: String,
        message: String,
    },
    /// Upstream payload does not match what the adapter expects.
    /// Halts the dataset until someone fixes the adapter or the feed.
    #[error("{source_name}: schema error: {message}")]
    Schema {
        source_name: String,
        message: String,
    },
}

impl SourceError {
    pub fn unavailable(source_name: &str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }

    pub fn schema(source_name: &str, message: impl Into<String>) -> Self {
        Self::Schema {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Failure raised by the object store client.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("{op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },
    /// Network or server-side failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Credentials, preconditions, bad configuration.
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("codec: {0}")]
    Codec(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}

/// An object key that does not follow the partition layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed partition key {key:?}: {reason}")]
pub struct MalformedKeyError {
    pub key: String,
    pub reason: &'static str,
}

impl MalformedKeyError {
    pub fn new(key: &str, reason: &'static str) -> Self {
        Self {
            key: key.to_string(),
            reason,
        }
    }
}

/// A field that could not be converted to its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field {field:?}: cannot coerce {value:?} to {expected}")]
pub struct CoercionError {
    pub field: String,
    pub value: String,
    pub expected: &'static str,
}

/// A partition that was written but not accepted for promotion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{partition}: validation failed: {reason}")]
pub struct ValidationFailure {
    pub partition: String,
    pub reason: String,
}

impl Retryable for ValidationFailure {
    fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_unavailable_retryable() {
        let err = SourceError::unavailable("weather", "HTTP 503");
        assert!(err.is_retryable());
    }

    #[test]
    fn source_schema_not_retryable() {
        let err = SourceError::schema("weather", "missing hourly.time");
        assert!(!err.is_retryable());
    }

    #[test]
    fn store_timeout_retryable() {
        let err = StoreError::Timeout {
            op: "put".into(),
            secs: 30,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "put timed out after 30s");
    }

    #[test]
    fn store_not_found_not_retryable() {
        assert!(!StoreError::NotFound("k".into()).is_retryable());
        assert!(!StoreError::Rejected("403".into()).is_retryable());
    }

    #[test]
    fn display_source_error() {
        let err = SourceError::unavailable("alerts", "timeout");
        assert_eq!(err.to_string(), "alerts: source unavailable: timeout");
    }

    #[test]
    fn display_malformed_key() {
        let err = MalformedKeyError::new("grupo5/x", "too few segments");
        assert!(err.to_string().contains("too few segments"));
    }
}
