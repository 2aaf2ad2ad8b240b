//! Store traits.
//!
//! Every trait has a Postgres implementation in [`crate::postgres`] and an
//! in-memory implementation in [`crate::memory`] with identical semantics.
//! Per-butler stores (sessions, state, actions, tasks) are constructed per
//! butler against that butler's schema-scoped pool; shared stores (inbox,
//! queue, registry, connectors, routing logs) belong to the switchboard.

use async_trait::async_trait;
use butlers_core::{ActionId, ButlerName, IngressId, RequestId, SessionId};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StorageResult;
use crate::records::{
    ActionStatus, ApprovalEvent, ConnectorRecord, EligibilityState, EligibilityTransition,
    FanoutLogRecord, InboxRecord, InboxStatus, NewInboxRecord, PendingActionRecord, QueueItem,
    RegistryRecord, RoutingLogRecord, SessionCompletion, SessionRecord, TaskRecord,
    TriggerAuditRecord,
};
use butlers_core::ConnectorHeartbeat;

/// The `message_inbox` table (shared schema; switchboard writes).
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert-or-noop on the dedupe key.
    ///
    /// Returns the canonical request id and whether the envelope was a
    /// duplicate (`true` means the returned id belongs to the original).
    async fn upsert(&self, record: NewInboxRecord) -> StorageResult<(RequestId, bool)>;

    /// Fetch one record.
    async fn get(&self, request_id: RequestId) -> StorageResult<Option<InboxRecord>>;

    /// Store the classifier's output and move to `classifying`-done state.
    async fn set_classification(&self, request_id: RequestId, classification: Value)
    -> StorageResult<()>;

    /// Store the aggregate fanout outcome and the terminal status.
    async fn set_routing_results(
        &self,
        request_id: RequestId,
        results: Value,
        status: InboxStatus,
    ) -> StorageResult<()>;

    /// Move the record's lifecycle status.
    async fn set_status(&self, request_id: RequestId, status: InboxStatus) -> StorageResult<()>;

    /// Total records (tests and stats).
    async fn count(&self) -> StorageResult<i64>;
}

/// The durable `ingress_queue` table backing the in-memory buffer.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new buffer item (unleased).
    async fn insert(&self, item: QueueItem) -> StorageResult<()>;

    /// Try to take the lease for one item.
    ///
    /// Succeeds only when the item exists and its lease is absent or
    /// expired; increments `attempts` on success.
    async fn try_lease(
        &self,
        ingress_id: IngressId,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Up to `limit` items enqueued before `grace_cutoff` whose lease is
    /// absent or expired, oldest first (cold-path recovery candidates).
    /// Read-only; the worker that picks an item up takes the lease.
    async fn stale(
        &self,
        grace_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<QueueItem>>;

    /// Remove a finished item.
    async fn complete(&self, ingress_id: IngressId) -> StorageResult<()>;

    /// Drop a lease so the scanner can retry the item later.
    async fn release(&self, ingress_id: IngressId) -> StorageResult<()>;

    /// Items still in the table.
    async fn depth(&self) -> StorageResult<i64>;
}

/// Per-butler `sessions` and `trigger_log` tables.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session row with status `running`.
    async fn insert_running(&self, record: SessionRecord) -> StorageResult<()>;

    /// Apply the terminal update. Returns `false` when the row was not in
    /// `running` (the update is applied exactly once).
    async fn complete(&self, session_id: SessionId, completion: SessionCompletion)
    -> StorageResult<bool>;

    /// Append one tool-call audit entry to a running session.
    async fn append_tool_call(&self, session_id: SessionId, call: Value) -> StorageResult<()>;

    /// Fetch one session.
    async fn get(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>>;

    /// Recent sessions, newest first.
    async fn list_recent(&self, limit: i64) -> StorageResult<Vec<SessionRecord>>;

    /// Children of one session (lineage adjacency).
    async fn children(&self, parent: SessionId) -> StorageResult<Vec<SessionRecord>>;

    /// Write one trigger audit row.
    async fn record_trigger(&self, record: TriggerAuditRecord) -> StorageResult<()>;
}

/// Per-butler `state` KV table.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read one key.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Upsert one key.
    async fn set(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Delete one key; returns whether it existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// All keys, sorted.
    async fn keys(&self) -> StorageResult<Vec<String>>;
}

/// The shared `butler_registry` and `eligibility_log` tables.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Register a butler or refresh an existing registration.
    ///
    /// A fresh registration of a `stale` butler restores it to `active`
    /// (`re_registered`); `first_seen_at` of an existing row is preserved.
    async fn upsert_registration(&self, record: RegistryRecord) -> StorageResult<()>;

    /// Record a heartbeat; restores `stale` to `active` (`health_restored`).
    /// Quarantine is not lifted by heartbeats.
    async fn heartbeat(&self, name: &ButlerName, at: DateTime<Utc>) -> StorageResult<()>;

    /// Fetch one entry.
    async fn get(&self, name: &ButlerName) -> StorageResult<Option<RegistryRecord>>;

    /// All entries.
    async fn list(&self) -> StorageResult<Vec<RegistryRecord>>;

    /// Move a butler's eligibility, appending to the log. No-op when the
    /// butler is already in `to`.
    async fn set_eligibility(
        &self,
        name: &ButlerName,
        to: EligibilityState,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// The transition log for one butler, oldest first.
    async fn eligibility_log(&self, name: &ButlerName) -> StorageResult<Vec<EligibilityTransition>>;
}

/// The shared `connector_registry` / `connector_heartbeat_log` /
/// `connector_stats_hourly` tables.
#[async_trait]
pub trait ConnectorStore: Send + Sync {
    /// Record one heartbeat, auto-creating the registry row on first
    /// contact. Returns `true` when the row was created.
    async fn record_heartbeat(
        &self,
        heartbeat: &ConnectorHeartbeat,
        at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Fetch one connector.
    async fn get(
        &self,
        connector_type: &str,
        endpoint_identity: &str,
    ) -> StorageResult<Option<ConnectorRecord>>;

    /// All connectors.
    async fn list(&self) -> StorageResult<Vec<ConnectorRecord>>;

    /// Fold heartbeat-log rows older than `cutoff` into hourly stats rows.
    /// Returns the number of log rows folded.
    async fn rollup(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;
}

/// Per-butler `pending_actions` and `approval_events` tables.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Insert a pending action and its `action_created` event.
    async fn insert(&self, record: PendingActionRecord) -> StorageResult<()>;

    /// Fetch one action.
    async fn get(&self, action_id: ActionId) -> StorageResult<Option<PendingActionRecord>>;

    /// Compare-and-set decision write (`WHERE status='pending'`).
    ///
    /// Returns `true` when this writer won; `false` when another decision
    /// landed first (0 rows affected).
    async fn cas_decide(
        &self,
        action_id: ActionId,
        to: ActionStatus,
        decided_at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Compare-and-set execution write (`WHERE status='approved'`), storing
    /// the execution result. Returns `true` when this writer won.
    async fn cas_mark_executed(
        &self,
        action_id: ActionId,
        result: Value,
        at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Append one immutable lifecycle event.
    async fn append_event(&self, event: ApprovalEvent) -> StorageResult<()>;

    /// Events for one action, oldest first.
    async fn events(&self, action_id: ActionId) -> StorageResult<Vec<ApprovalEvent>>;

    /// Pending actions whose `expires_at` has passed.
    async fn expired_pending(&self, now: DateTime<Utc>) -> StorageResult<Vec<ActionId>>;

    /// All pending actions, oldest first.
    async fn list_pending(&self) -> StorageResult<Vec<PendingActionRecord>>;
}

/// Per-butler `scheduled_tasks` table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or refresh a task definition, preserving run bookkeeping.
    async fn upsert(&self, record: TaskRecord) -> StorageResult<()>;

    /// Fetch one task.
    async fn get(&self, name: &str) -> StorageResult<Option<TaskRecord>>;

    /// All enabled tasks.
    async fn list_enabled(&self) -> StorageResult<Vec<TaskRecord>>;

    /// Compare-and-set firing: advances `last_run_at`/`next_run_at` only
    /// when `next_run_at` still equals `expected_due`. Returns `true` when
    /// this ticker won the cycle.
    async fn cas_fire(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_due: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Initialize `next_run_at` when unset (first schedule computation).
    async fn set_next_due(&self, name: &str, next_due: DateTime<Utc>) -> StorageResult<()>;

    /// Enable or disable a task.
    async fn set_enabled(&self, name: &str, enabled: bool) -> StorageResult<()>;
}

/// The shared `routing_log` and `fanout_execution_log` tables.
#[async_trait]
pub trait RoutingLogStore: Send + Sync {
    /// Record one router invocation.
    async fn record_route(&self, record: RoutingLogRecord) -> StorageResult<()>;

    /// Record one fanout subrequest outcome.
    async fn record_fanout(&self, record: FanoutLogRecord) -> StorageResult<()>;

    /// Fanout rows for one request, oldest first.
    async fn fanout_for_request(&self, request_id: RequestId)
    -> StorageResult<Vec<FanoutLogRecord>>;
}
