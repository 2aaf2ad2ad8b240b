//! Ingress error types.

use butlers_core::{CoreError, ErrorClass};
use thiserror::Error;

/// Errors raised on the ingest path.
#[derive(Debug, Error)]
pub enum IngressError {
    /// The envelope failed validation.
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// The persistence layer failed (connector should retry with backoff).
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),
}

/// Result alias for ingress operations.
pub type IngressResult<T> = Result<T, IngressError>;

impl IngressError {
    /// Map onto the canonical cross-layer taxonomy.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(e) => e.class(),
            Self::Storage(_) => ErrorClass::InternalError,
        }
    }
}
