//! Storage error types.

use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Could not reach or open the database.
    #[error("database connection failed: {0}")]
    Connection(String),

    /// A query failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A migration chain failed part-way.
    #[error("migration {chain}/{revision} failed: {reason}")]
    Migration {
        /// Chain name.
        chain: String,
        /// Revision that failed.
        revision: String,
        /// Why it failed.
        reason: String,
    },

    /// A row that must exist does not.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or state precondition was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A value could not be (de)serialized at the persistence boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
