//! Butlers Approval - Gating for sensitive tool calls.
//!
//! A gated tool call is intercepted before execution. Standing rules may
//! pre-approve it; otherwise a pending action waits for an operator
//! decision. Decisions are compare-and-set writes, execution is idempotent
//! behind a per-action lock, and every transition lands in the append-only
//! `approval_events` log.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod engine;
mod error;
mod rules;

pub use engine::{ApprovalsEngine, DecisionOutcome, GateOutcome};
pub use error::{ApprovalError, ApprovalResult};
pub use rules::{RuleConstraint, RuleId, RuleSet, StandingRule};
