//! Registry error types.

use butlers_core::ButlerName;
use butlers_storage::EligibilityState;
use thiserror::Error;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No entry for the named butler.
    #[error("unknown butler: {0}")]
    UnknownButler(ButlerName),

    /// The butler exists but is not routable.
    #[error("butler {name} is {state:?}")]
    Ineligible {
        /// The butler.
        name: ButlerName,
        /// Its current eligibility.
        state: EligibilityState,
    },

    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),

    /// A heartbeat envelope failed validation.
    #[error("invalid heartbeat: {0}")]
    InvalidHeartbeat(String),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
