//! Persisted row shapes shared across subsystems.
//!
//! Stores speak these structs; JSON appears only inside explicitly-typed
//! `Value` columns (payloads, classifications, tool args).

use butlers_core::envelope::PolicyTier;
use butlers_core::{ActionId, ButlerName, IngressId, RequestId, SessionId, TriggerSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Message inbox
// ---------------------------------------------------------------------------

/// Lifecycle of one inbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    /// Persisted, awaiting a worker.
    Accepted,
    /// A worker is classifying the message.
    Classifying,
    /// Fanout in flight.
    Routing,
    /// All subrequests resolved.
    Completed,
    /// Terminal failure.
    Failed,
}

impl InboxStatus {
    /// Whether this status ends the record's lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable column string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Classifying => "classifying",
            Self::Routing => "routing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a column string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "accepted" => Some(Self::Accepted),
            "classifying" => Some(Self::Classifying),
            "routing" => Some(Self::Routing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Insert shape for one ingested message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInboxRecord {
    /// Server-minted canonical id.
    pub request_id: RequestId,
    /// Uniqueness key; see `butlers_core::dedupe_key`.
    pub dedupe_key: String,
    /// Source channel string.
    pub channel: String,
    /// Source provider string.
    pub provider: String,
    /// Endpoint identity.
    pub endpoint_identity: String,
    /// Sender identity.
    pub sender_identity: String,
    /// Full envelope payload (opaque to the core).
    pub payload: Value,
    /// Best-available message text.
    pub normalized_text: String,
    /// Requested priority tier.
    pub policy_tier: PolicyTier,
    /// When the core observed the message.
    pub observed_at: DateTime<Utc>,
}

/// One fully-loaded inbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    /// Insert fields.
    #[serde(flatten)]
    pub new: NewInboxRecord,
    /// Classifier output, once produced.
    pub classification: Option<Value>,
    /// Aggregated fanout outcome, once produced.
    pub routing_results: Option<Value>,
    /// Lifecycle status.
    pub status: InboxStatus,
}

// ---------------------------------------------------------------------------
// Ingress queue
// ---------------------------------------------------------------------------

/// One durable ingress buffer item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Buffer item id.
    pub ingress_id: IngressId,
    /// The inbox record this item drives.
    pub request_id: RequestId,
    /// Priority tier.
    pub priority_tier: PolicyTier,
    /// Enqueue time (FIFO key within a tier).
    pub enqueued_at: DateTime<Utc>,
    /// Worker currently holding the lease.
    pub leased_by: Option<String>,
    /// Lease expiry.
    pub leased_until: Option<DateTime<Utc>>,
    /// Processing attempts so far.
    pub attempts: i32,
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Lifecycle of one session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Adapter invocation in flight.
    Running,
    /// Adapter returned successfully.
    Completed,
    /// Adapter failed or timed out.
    Error,
}

impl SessionStatus {
    /// Stable column string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse a column string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One LLM-CLI session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id.
    pub session_id: SessionId,
    /// Owning butler.
    pub butler_name: ButlerName,
    /// What triggered the session.
    pub trigger_source: TriggerSource,
    /// The prompt handed to the adapter.
    pub prompt: String,
    /// Model used.
    pub model: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Row insert time.
    pub created_at: DateTime<Utc>,
    /// Terminal update time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration; `>= 0` once completed.
    pub duration_ms: Option<i64>,
    /// Ground-truth tool call audit entries.
    pub tool_calls: Vec<Value>,
    /// Input token usage.
    pub input_tokens: Option<i64>,
    /// Output token usage.
    pub output_tokens: Option<i64>,
    /// Distributed trace id.
    pub trace_id: Option<String>,
    /// Terminal error message, when status is `error`.
    pub error: Option<String>,
    /// Parent session for nested lineage (tree, not graph).
    pub parent_session_id: Option<SessionId>,
}

/// Terminal update applied to a running session exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompletion {
    /// Terminal status (`completed` or `error`).
    pub status: SessionStatus,
    /// Terminal time.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Tool calls captured during the turn.
    pub tool_calls: Vec<Value>,
    /// Input token usage.
    pub input_tokens: Option<i64>,
    /// Output token usage.
    pub output_tokens: Option<i64>,
    /// Error message on failure.
    pub error: Option<String>,
}

/// One trigger audit row, written for every `trigger()` regardless of
/// whether a session was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAuditRecord {
    /// Target butler.
    pub butler_name: ButlerName,
    /// Trigger source.
    pub trigger_source: TriggerSource,
    /// Session created, if dispatch was admitted.
    pub session_id: Option<SessionId>,
    /// Outcome string (`dispatched`, `overload_rejected`, ...).
    pub outcome: String,
    /// When the trigger arrived.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Butler eligibility as seen by the router and classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityState {
    /// Routable.
    Active,
    /// Excluded until operator action.
    Quarantined,
    /// Liveness TTL expired.
    Stale,
}

impl EligibilityState {
    /// Stable column string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Quarantined => "quarantined",
            Self::Stale => "stale",
        }
    }

    /// Parse a column string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "quarantined" => Some(Self::Quarantined),
            "stale" => Some(Self::Stale),
            _ => None,
        }
    }
}

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// Butler name (registry key).
    pub name: ButlerName,
    /// Mesh endpoint URL.
    pub endpoint_url: String,
    /// Lowest route contract version the butler accepts.
    pub route_contract_min: i32,
    /// Highest route contract version the butler accepts.
    pub route_contract_max: i32,
    /// Capability strings shown to the classifier.
    pub capabilities: Vec<String>,
    /// One-line description shown to the classifier.
    pub description: String,
    /// Current eligibility.
    pub eligibility_state: EligibilityState,
    /// Last heartbeat observed.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Granted liveness TTL, seconds.
    pub liveness_ttl_s: i64,
    /// Why the butler is quarantined, when it is.
    pub quarantine_reason: Option<String>,
    /// First registration time.
    pub first_seen_at: DateTime<Utc>,
}

/// One append-only eligibility transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityTransition {
    /// Butler name.
    pub name: ButlerName,
    /// State before.
    pub from: EligibilityState,
    /// State after.
    pub to: EligibilityState,
    /// Transition reason (`ttl_expired`, `health_restored`, ...).
    pub reason: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// One connector registry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    /// Connector kind.
    pub connector_type: String,
    /// Endpoint identity.
    pub endpoint_identity: String,
    /// Most recent instance id.
    pub instance_id: String,
    /// Last reported state string.
    pub state: String,
    /// Latest monotonic counters.
    pub counters: BTreeMap<String, u64>,
    /// Latest checkpoint, when reported.
    pub checkpoint: Option<Value>,
    /// First heartbeat time (auto-create).
    pub first_seen_at: DateTime<Utc>,
    /// Last heartbeat time.
    pub last_seen_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// Risk tier of a gated tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Reversible, low blast radius.
    Low,
    /// Reversible with effort.
    Medium,
    /// Hard to reverse.
    High,
    /// Irreversible or safety-relevant.
    Critical,
}

impl RiskTier {
    /// Stable column string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse a column string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Lifecycle of one pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved, not yet executed.
    Approved,
    /// Rejected.
    Rejected,
    /// Timed out before decision.
    Expired,
    /// Approved and executed.
    Executed,
}

impl ActionStatus {
    /// Stable column string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Executed => "executed",
        }
    }

    /// Parse a column string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "executed" => Some(Self::Executed),
            _ => None,
        }
    }
}

/// One gated action awaiting (or past) decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingActionRecord {
    /// Action id.
    pub action_id: ActionId,
    /// Butler the tool belongs to.
    pub butler: ButlerName,
    /// Gated tool name.
    pub tool_name: String,
    /// Tool arguments captured at interception.
    pub tool_args: Value,
    /// Lifecycle status.
    pub status: ActionStatus,
    /// Risk tier of the gated tool.
    pub risk_tier: RiskTier,
    /// When the action was intercepted.
    pub created_at: DateTime<Utc>,
    /// When a decision landed.
    pub decided_at: Option<DateTime<Utc>>,
    /// When an undecided action expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Stored execution result; null until executed.
    pub execution_result: Option<Value>,
}

/// One immutable approval lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    /// Action the event belongs to.
    pub action_id: ActionId,
    /// Event kind (`action_created`, `action_approved`, ...).
    pub kind: String,
    /// Free-form detail.
    pub detail: Option<Value>,
    /// Event time.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scheduled tasks
// ---------------------------------------------------------------------------

/// One scheduled task row, unique per (butler, name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task name.
    pub name: String,
    /// 5-field UTC cron expression.
    pub cron: String,
    /// Dispatch mode string (`prompt` or `job`).
    pub dispatch_mode: String,
    /// Whether the task fires.
    pub enabled: bool,
    /// Static prompt for prompt-mode tasks.
    pub prompt: Option<String>,
    /// Handler name for job-mode tasks.
    pub job_name: Option<String>,
    /// JSON args for job-mode tasks.
    pub job_args: Option<Value>,
    /// Last firing time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time (stagger applied).
    pub next_run_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Routing logs
// ---------------------------------------------------------------------------

/// One router invocation log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingLogRecord {
    /// Request this call belonged to, when known.
    pub request_id: Option<RequestId>,
    /// Target butler.
    pub target: ButlerName,
    /// Tool invoked.
    pub tool: String,
    /// Outcome string (`ok` or a canonical error class).
    pub outcome: String,
    /// Call duration in milliseconds.
    pub duration_ms: i64,
    /// When the call finished.
    pub at: DateTime<Utc>,
}

/// One fanout subrequest outcome row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutLogRecord {
    /// Request the plan belonged to.
    pub request_id: RequestId,
    /// Subrequest id within the plan.
    pub subrequest_id: String,
    /// Target butler.
    pub butler: ButlerName,
    /// Outcome string (`success`, `failed`, `timeout`, `skipped`, `cancelled`).
    pub outcome: String,
    /// Structured detail.
    pub detail: Option<Value>,
    /// When the subrequest resolved.
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_status_terminality() {
        assert!(InboxStatus::Completed.is_terminal());
        assert!(InboxStatus::Failed.is_terminal());
        assert!(!InboxStatus::Accepted.is_terminal());
        assert!(!InboxStatus::Routing.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrips() {
        for status in [
            InboxStatus::Accepted,
            InboxStatus::Classifying,
            InboxStatus::Routing,
            InboxStatus::Completed,
            InboxStatus::Failed,
        ] {
            assert_eq!(InboxStatus::parse(status.as_str()), Some(status));
        }
        for status in [SessionStatus::Running, SessionStatus::Completed, SessionStatus::Error] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            ActionStatus::Pending,
            ActionStatus::Approved,
            ActionStatus::Rejected,
            ActionStatus::Expired,
            ActionStatus::Executed,
        ] {
            assert_eq!(ActionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InboxStatus::parse("nonsense"), None);
    }

    #[test]
    fn test_risk_tier_ordering() {
        assert!(RiskTier::High > RiskTier::Medium);
        assert!(RiskTier::Critical > RiskTier::High);
    }
}
