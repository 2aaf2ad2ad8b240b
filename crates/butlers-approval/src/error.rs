//! Approval error types.

use butlers_core::ActionId;
use butlers_storage::ActionStatus;
use thiserror::Error;

/// Errors raised by the approvals engine.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No action with that id.
    #[error("unknown action: {0}")]
    UnknownAction(ActionId),

    /// A standing rule violates the tier constraints.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Execution was requested for an action that is not approved.
    #[error("action {action_id} is {status:?}, not approved")]
    NotApproved {
        /// The action.
        action_id: ActionId,
        /// Its current status.
        status: ActionStatus,
    },

    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),

    /// The tool executor itself failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result alias for approval operations.
pub type ApprovalResult<T> = Result<T, ApprovalError>;
