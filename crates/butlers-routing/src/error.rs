//! Routing error types.

use butlers_core::{ErrorBody, ErrorClass};
use thiserror::Error;

/// A classified route failure, carried end to end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct RouteFailure {
    /// Canonical class.
    pub class: ErrorClass,
    /// Human-readable detail.
    pub message: String,
}

impl RouteFailure {
    /// Build a failure.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Whether the dispatcher may retry this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }

    /// The wire body for this failure.
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.class, self.message.clone())
    }
}

impl From<ErrorBody> for RouteFailure {
    fn from(body: ErrorBody) -> Self {
        Self {
            class: body.class,
            message: body.message,
        }
    }
}

/// Errors raised by the routing pipeline outside of route calls.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),

    /// The plan failed validation.
    #[error("invalid fanout plan: {0}")]
    InvalidPlan(String),
}

/// Result alias for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;
