//! Fanout plan construction and validation.

use butlers_core::ButlerName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use crate::classifier::ClassificationEntry;

/// How subrequests are arranged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// Launch everything concurrently.
    #[default]
    Parallel,
    /// Execute in dependency order.
    Ordered,
    /// Dependency order with `run_if` driving skip decisions.
    Conditional,
}

/// When the plan as a whole is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Block until every active subrequest terminates.
    #[default]
    WaitForAll,
    /// The first successful completion cancels the rest.
    FirstSuccess,
}

/// What a subrequest failure does to the rest of the plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Failures never cancel siblings.
    #[default]
    Continue,
    /// A `required` failure cancels the remainder.
    OnRequiredFailure,
    /// Any failure cancels the remainder.
    OnAnyFailure,
}

/// Gate between a subrequest and its dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunIf {
    /// Run only when every dependency succeeded.
    #[default]
    Success,
    /// Run when every dependency terminated (success or failure).
    Completed,
    /// Run unconditionally.
    Always,
}

/// One unit of fanout work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subrequest {
    /// Plan-unique id.
    pub subrequest_id: String,
    /// The message segment this subrequest covers.
    pub segment_id: String,
    /// Target butler.
    pub butler: ButlerName,
    /// Self-contained prompt.
    pub prompt: String,
    /// Ids of earlier subrequests this one depends on.
    pub depends_on: Vec<String>,
    /// Gate against dependency outcomes.
    pub run_if: RunIf,
    /// Whether this subrequest's failure matters to the abort policy.
    pub required: bool,
}

/// Plan validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// A plan needs at least one subrequest.
    #[error("plan has no subrequests")]
    Empty,

    /// Duplicate subrequest id.
    #[error("duplicate subrequest id: {0}")]
    DuplicateId(String),

    /// `depends_on` must reference a prior subrequest.
    #[error("subrequest {subrequest} references {dependency}, which is not an earlier subrequest")]
    ForwardOrUnknownDependency {
        /// The referencing subrequest.
        subrequest: String,
        /// The bad reference.
        dependency: String,
    },
}

/// An ordered set of subrequests plus execution policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutPlan {
    /// Arrangement mode.
    pub mode: FanoutMode,
    /// Join policy.
    pub join_policy: JoinPolicy,
    /// Abort policy.
    pub abort_policy: AbortPolicy,
    /// The subrequests, in plan order.
    pub subrequests: Vec<Subrequest>,
}

impl FanoutPlan {
    /// Build a plan from classification entries.
    ///
    /// Defaults: `parallel` / `wait_for_all` / `continue`. Routing hints
    /// may override `fanout_mode`, `join_policy`, and `abort_policy`. In
    /// `ordered` and `conditional` modes each subrequest depends on its
    /// predecessor (ordered gates on completion, conditional on success).
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] when the entry set is empty or validation
    /// fails.
    pub fn build(
        entries: &[ClassificationEntry],
        hints: Option<&Value>,
    ) -> Result<Self, PlanError> {
        if entries.is_empty() {
            return Err(PlanError::Empty);
        }

        let mode = hint_field(hints, "fanout_mode").unwrap_or_default();
        let join_policy = hint_field(hints, "join_policy").unwrap_or_default();
        let abort_policy = hint_field(hints, "abort_policy").unwrap_or_default();

        let chain_run_if = match mode {
            FanoutMode::Parallel => None,
            FanoutMode::Ordered => Some(RunIf::Completed),
            FanoutMode::Conditional => Some(RunIf::Success),
        };

        let subrequests = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| Subrequest {
                subrequest_id: format!("sub-{i}"),
                segment_id: format!("seg-{i}"),
                butler: entry.butler.clone(),
                prompt: entry.prompt.clone(),
                depends_on: match (chain_run_if, i) {
                    (Some(_), i) if i > 0 => vec![format!("sub-{}", i - 1)],
                    _ => Vec::new(),
                },
                run_if: chain_run_if.unwrap_or(RunIf::Always),
                required: true,
            })
            .collect();

        let plan = Self {
            mode,
            join_policy,
            abort_policy,
            subrequests,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Validate id uniqueness and dependency ordering.
    ///
    /// `depends_on` may only reference earlier subrequests, which rules
    /// out cycles and forward references in one pass (topological order is
    /// the plan order itself).
    ///
    /// # Errors
    ///
    /// Returns the first [`PlanError`] found.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.subrequests.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for sub in &self.subrequests {
            for dependency in &sub.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(PlanError::ForwardOrUnknownDependency {
                        subrequest: sub.subrequest_id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if !seen.insert(&sub.subrequest_id) {
                return Err(PlanError::DuplicateId(sub.subrequest_id.clone()));
            }
        }
        Ok(())
    }
}

fn hint_field<T: serde::de::DeserializeOwned + Default>(
    hints: Option<&Value>,
    key: &str,
) -> Option<T> {
    hints
        .and_then(|h| h.get(key))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
