//! Runtime error types.

use butlers_core::ButlerName;
use thiserror::Error;

/// Errors raised while running adapter turns.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The adapter CLI binary is not on PATH.
    #[error("adapter binary not found: {0}")]
    AdapterNotFound(String),

    /// The CLI exited non-zero. Never folded into an in-band error string.
    #[error("adapter exited with {code:?}: {stderr}")]
    AdapterFailed {
        /// Process exit code, when the process was not killed.
        code: Option<i32>,
        /// Captured stderr tail.
        stderr: String,
    },

    /// The adapter ran past its deadline and was killed.
    #[error("adapter timed out after {timeout_s}s")]
    AdapterTimeout {
        /// The configured timeout.
        timeout_s: u64,
    },

    /// The CLI produced output the adapter could not parse.
    #[error("unparseable adapter output: {0}")]
    OutputParse(String),

    /// The dispatch lock or queue rejected the caller.
    #[error("butler {butler} is at capacity ({reason})")]
    OverloadRejected {
        /// The busy butler.
        butler: ButlerName,
        /// Lock-held or queue-full.
        reason: String,
    },

    /// The system prompt file is missing or unreadable.
    #[error("system prompt unavailable: {0}")]
    SystemPrompt(String),

    /// Subprocess plumbing failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),
}

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    /// Map onto the canonical cross-layer taxonomy.
    #[must_use]
    pub const fn class(&self) -> butlers_core::ErrorClass {
        match self {
            Self::OverloadRejected { .. } => butlers_core::ErrorClass::OverloadRejected,
            Self::AdapterTimeout { .. } => butlers_core::ErrorClass::Timeout,
            _ => butlers_core::ErrorClass::InternalError,
        }
    }
}
