//! Scheduler error types.

use thiserror::Error;

/// Errors raised by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A cron expression failed to parse.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// What was wrong.
        reason: String,
    },

    /// A job-mode task names a handler nobody registered.
    #[error("unknown job handler: {0}")]
    UnknownJob(String),

    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
