//! Canonical error taxonomy shared across the mesh, route, and notify layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical error classes carried on every cross-butler failure.
///
/// The same seven classes appear in `route_response.v1` bodies, notify
/// responses, and mesh RPC error data, so connectors and dispatchers can
/// make retry decisions without parsing free-form messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Input, schema, or auth violation. Never retryable.
    ValidationError,
    /// Endpoint offline or unreachable. Retryable.
    TargetUnavailable,
    /// The registry rejects the target. Requires operator action.
    TargetQuarantined,
    /// Deadline exceeded. Retry is the caller's choice.
    Timeout,
    /// Capacity limit hit or dispatch lock held. Retryable with backoff.
    OverloadRejected,
    /// Unexpected failure. Logged and surfaced as 5xx. Retryable.
    InternalError,
    /// Dedupe hit on ingress. A success, not a failure.
    ConflictNoop,
}

impl ErrorClass {
    /// Whether a caller should retry without operator involvement.
    ///
    /// `Timeout` reports `false` here; retrying a timed-out call is an
    /// explicit caller decision, not a default.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TargetUnavailable | Self::OverloadRejected | Self::InternalError
        )
    }

    /// Stable wire string for this class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::TargetUnavailable => "target_unavailable",
            Self::TargetQuarantined => "target_quarantined",
            Self::Timeout => "timeout",
            Self::OverloadRejected => "overload_rejected",
            Self::InternalError => "internal_error",
            Self::ConflictNoop => "conflict_noop",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error body as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Canonical class.
    pub class: ErrorClass,
    /// Human-readable detail.
    pub message: String,
    /// Whether the emitter considers the failure retryable.
    pub retryable: bool,
}

impl ErrorBody {
    /// Build a body from a class and message, deriving `retryable`.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retryable: class.is_retryable(),
        }
    }
}

/// Errors produced by the foundation layer itself.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The envelope declared a schema version this core does not speak.
    #[error("unsupported schema version: {0}")]
    UnsupportedSchemaVersion(String),

    /// The envelope failed structural validation.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A channel/provider pairing outside the accepted table.
    #[error("unknown channel/provider pairing: {channel}/{provider}")]
    UnknownChannelProvider {
        /// Declared channel.
        channel: String,
        /// Declared provider.
        provider: String,
    },

    /// A timestamp without an explicit UTC offset.
    #[error("timestamp must be RFC3339 with explicit offset: {0}")]
    NaiveTimestamp(String),

    /// JSON (de)serialization failure at a boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for foundation operations.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Map this error onto the canonical taxonomy.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::UnsupportedSchemaVersion(_)
            | Self::InvalidEnvelope(_)
            | Self::UnknownChannelProvider { .. }
            | Self::NaiveTimestamp(_) => ErrorClass::ValidationError,
            Self::Serialization(_) => ErrorClass::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_table() {
        assert!(ErrorClass::TargetUnavailable.is_retryable());
        assert!(ErrorClass::OverloadRejected.is_retryable());
        assert!(ErrorClass::InternalError.is_retryable());
        assert!(!ErrorClass::ValidationError.is_retryable());
        assert!(!ErrorClass::TargetQuarantined.is_retryable());
        assert!(!ErrorClass::Timeout.is_retryable());
        assert!(!ErrorClass::ConflictNoop.is_retryable());
    }

    #[test]
    fn test_wire_strings() {
        assert_eq!(ErrorClass::ValidationError.as_str(), "validation_error");
        assert_eq!(
            serde_json::to_string(&ErrorClass::OverloadRejected).unwrap(),
            "\"overload_rejected\""
        );
        let back: ErrorClass = serde_json::from_str("\"conflict_noop\"").unwrap();
        assert_eq!(back, ErrorClass::ConflictNoop);
    }

    #[test]
    fn test_error_body_derives_retryable() {
        let body = ErrorBody::new(ErrorClass::TargetUnavailable, "connection refused");
        assert!(body.retryable);
        let body = ErrorBody::new(ErrorClass::ValidationError, "bad schema");
        assert!(!body.retryable);
    }

    #[test]
    fn test_core_error_classification() {
        let err = CoreError::UnsupportedSchemaVersion("ingest.v0".to_string());
        assert_eq!(err.class(), ErrorClass::ValidationError);
        assert_eq!(
            err.to_string(),
            "unsupported schema version: ingest.v0"
        );
    }
}
