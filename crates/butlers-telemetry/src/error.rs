//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur in telemetry operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Subscriber initialization error.
    #[error("initialization error: {0}")]
    Init(String),

    /// A malformed `traceparent` header value.
    #[error("invalid traceparent: {0}")]
    InvalidTraceparent(String),
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
