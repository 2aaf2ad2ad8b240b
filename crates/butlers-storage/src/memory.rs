//! In-memory store implementations.
//!
//! Semantics mirror the Postgres implementations exactly, including CAS
//! behavior (a losing writer observes "0 rows affected" as `false`). Used
//! by the test suite and the `mem:` development mode.

use async_trait::async_trait;
use butlers_core::{ActionId, ButlerName, ConnectorHeartbeat, IngressId, RequestId, SessionId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::records::{
    ActionStatus, ApprovalEvent, ConnectorRecord, EligibilityState, EligibilityTransition,
    FanoutLogRecord, InboxRecord, InboxStatus, NewInboxRecord, PendingActionRecord, QueueItem,
    RegistryRecord, RoutingLogRecord, SessionCompletion, SessionRecord, SessionStatus, TaskRecord,
    TriggerAuditRecord,
};
use crate::stores::{
    ActionStore, ConnectorStore, InboxStore, QueueStore, RegistryStore, RoutingLogStore,
    SessionStore, StateStore, TaskStore,
};

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// In-memory `message_inbox`.
#[derive(Debug, Default)]
pub struct MemoryInboxStore {
    inner: Mutex<MemoryInboxInner>,
}

#[derive(Debug, Default)]
struct MemoryInboxInner {
    by_request: HashMap<RequestId, InboxRecord>,
    by_dedupe: HashMap<String, RequestId>,
}

impl MemoryInboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    async fn upsert(&self, record: NewInboxRecord) -> StorageResult<(RequestId, bool)> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.by_dedupe.get(&record.dedupe_key) {
            return Ok((*existing, true));
        }
        let request_id = record.request_id;
        inner.by_dedupe.insert(record.dedupe_key.clone(), request_id);
        inner.by_request.insert(
            request_id,
            InboxRecord {
                new: record,
                classification: None,
                routing_results: None,
                status: InboxStatus::Accepted,
            },
        );
        Ok((request_id, false))
    }

    async fn get(&self, request_id: RequestId) -> StorageResult<Option<InboxRecord>> {
        Ok(self.inner.lock().await.by_request.get(&request_id).cloned())
    }

    async fn set_classification(
        &self,
        request_id: RequestId,
        classification: Value,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .by_request
            .get_mut(&request_id)
            .ok_or_else(|| StorageError::NotFound(format!("inbox {request_id}")))?;
        record.classification = Some(classification);
        Ok(())
    }

    async fn set_routing_results(
        &self,
        request_id: RequestId,
        results: Value,
        status: InboxStatus,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .by_request
            .get_mut(&request_id)
            .ok_or_else(|| StorageError::NotFound(format!("inbox {request_id}")))?;
        record.routing_results = Some(results);
        record.status = status;
        Ok(())
    }

    async fn set_status(&self, request_id: RequestId, status: InboxStatus) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .by_request
            .get_mut(&request_id)
            .ok_or_else(|| StorageError::NotFound(format!("inbox {request_id}")))?;
        record.status = status;
        Ok(())
    }

    async fn count(&self) -> StorageResult<i64> {
        Ok(self.inner.lock().await.by_request.len() as i64)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// In-memory `ingress_queue`.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    items: Mutex<HashMap<IngressId, QueueItem>>,
}

impl MemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lease_open(item: &QueueItem, now: DateTime<Utc>) -> bool {
    match item.leased_until {
        None => true,
        Some(until) => until <= now,
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, item: QueueItem) -> StorageResult<()> {
        self.items.lock().await.insert(item.ingress_id, item);
        Ok(())
    }

    async fn try_lease(
        &self,
        ingress_id: IngressId,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut items = self.items.lock().await;
        let Some(item) = items.get_mut(&ingress_id) else {
            return Ok(false);
        };
        if !lease_open(item, now) {
            return Ok(false);
        }
        item.leased_by = Some(worker.to_string());
        item.leased_until = Some(until);
        item.attempts = item.attempts.saturating_add(1);
        Ok(true)
    }

    async fn stale(
        &self,
        grace_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<QueueItem>> {
        let items = self.items.lock().await;
        let mut candidates: Vec<QueueItem> = items
            .values()
            .filter(|item| item.enqueued_at <= grace_cutoff && lease_open(item, now))
            .cloned()
            .collect();
        candidates.sort_by_key(|item| item.enqueued_at);
        candidates.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(candidates)
    }

    async fn complete(&self, ingress_id: IngressId) -> StorageResult<()> {
        self.items.lock().await.remove(&ingress_id);
        Ok(())
    }

    async fn release(&self, ingress_id: IngressId) -> StorageResult<()> {
        let mut items = self.items.lock().await;
        if let Some(item) = items.get_mut(&ingress_id) {
            item.leased_by = None;
            item.leased_until = None;
        }
        Ok(())
    }

    async fn depth(&self) -> StorageResult<i64> {
        Ok(self.items.lock().await.len() as i64)
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// In-memory `sessions` + `trigger_log` for one butler.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemorySessionInner>,
}

#[derive(Debug, Default)]
struct MemorySessionInner {
    sessions: HashMap<SessionId, SessionRecord>,
    order: Vec<SessionId>,
    triggers: Vec<TriggerAuditRecord>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All trigger audit rows, oldest first (test hook).
    pub async fn triggers(&self) -> Vec<TriggerAuditRecord> {
        self.inner.lock().await.triggers.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert_running(&self, record: SessionRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&record.session_id) {
            return Err(StorageError::Conflict(format!(
                "session {} already exists",
                record.session_id
            )));
        }
        inner.order.push(record.session_id);
        inner.sessions.insert(record.session_id, record);
        Ok(())
    }

    async fn complete(
        &self,
        session_id: SessionId,
        completion: SessionCompletion,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.sessions.get_mut(&session_id) else {
            return Ok(false);
        };
        if record.status != SessionStatus::Running {
            return Ok(false);
        }
        record.status = completion.status;
        record.completed_at = Some(completion.completed_at);
        record.duration_ms = Some(completion.duration_ms);
        record.tool_calls.extend(completion.tool_calls);
        record.input_tokens = completion.input_tokens;
        record.output_tokens = completion.output_tokens;
        record.error = completion.error;
        Ok(true)
    }

    async fn append_tool_call(&self, session_id: SessionId, call: Value) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StorageError::NotFound(format!("session {session_id}")))?;
        record.tool_calls.push(call);
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        Ok(self.inner.lock().await.sessions.get(&session_id).cloned())
    }

    async fn list_recent(&self, limit: i64) -> StorageResult<Vec<SessionRecord>> {
        let inner = self.inner.lock().await;
        let take = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(inner
            .order
            .iter()
            .rev()
            .take(take)
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect())
    }

    async fn children(&self, parent: SessionId) -> StorageResult<Vec<SessionRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .filter(|s| s.parent_session_id == Some(parent))
            .cloned()
            .collect())
    }

    async fn record_trigger(&self, record: TriggerAuditRecord) -> StorageResult<()> {
        self.inner.lock().await.triggers.push(record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State KV
// ---------------------------------------------------------------------------

/// In-memory per-butler `state` table.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.values.lock().await.remove(key).is_some())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.values.lock().await.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory `butler_registry` + `eligibility_log`.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    inner: Mutex<MemoryRegistryInner>,
}

#[derive(Debug, Default)]
struct MemoryRegistryInner {
    entries: HashMap<ButlerName, RegistryRecord>,
    log: Vec<EligibilityTransition>,
}

impl MemoryRegistryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryRegistryInner {
    fn transition(
        &mut self,
        name: &ButlerName,
        to: EligibilityState,
        reason: &str,
        at: DateTime<Utc>,
    ) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        if entry.eligibility_state == to {
            return;
        }
        let from = entry.eligibility_state;
        entry.eligibility_state = to;
        if to != EligibilityState::Quarantined {
            entry.quarantine_reason = None;
        } else {
            entry.quarantine_reason = Some(reason.to_string());
        }
        self.log.push(EligibilityTransition {
            name: name.clone(),
            from,
            to,
            reason: reason.to_string(),
            at,
        });
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn upsert_registration(&self, record: RegistryRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let prior = inner
            .entries
            .get(&record.name)
            .map(|e| (e.first_seen_at, e.eligibility_state, e.quarantine_reason.clone()));
        if let Some((first_seen_at, was, quarantine_reason)) = prior {
            let name = record.name.clone();
            let mut updated = record;
            updated.first_seen_at = first_seen_at;
            // Quarantine (and its reason) survives re-registration;
            // staleness does not.
            updated.eligibility_state = was;
            updated.quarantine_reason = quarantine_reason;
            inner.entries.insert(name.clone(), updated);
            if was == EligibilityState::Stale {
                inner.transition(&name, EligibilityState::Active, "re_registered", Utc::now());
            }
        } else {
            inner.entries.insert(record.name.clone(), record);
        }
        Ok(())
    }

    async fn heartbeat(&self, name: &ButlerName, at: DateTime<Utc>) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let state = {
            let entry = inner
                .entries
                .get_mut(name)
                .ok_or_else(|| StorageError::NotFound(format!("registry entry {name}")))?;
            entry.last_heartbeat_at = at;
            entry.eligibility_state
        };
        if state == EligibilityState::Stale {
            inner.transition(name, EligibilityState::Active, "health_restored", at);
        }
        Ok(())
    }

    async fn get(&self, name: &ButlerName) -> StorageResult<Option<RegistryRecord>> {
        Ok(self.inner.lock().await.entries.get(name).cloned())
    }

    async fn list(&self) -> StorageResult<Vec<RegistryRecord>> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<_> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn set_eligibility(
        &self,
        name: &ButlerName,
        to: EligibilityState,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(name) {
            return Err(StorageError::NotFound(format!("registry entry {name}")));
        }
        inner.transition(name, to, reason, at);
        Ok(())
    }

    async fn eligibility_log(
        &self,
        name: &ButlerName,
    ) -> StorageResult<Vec<EligibilityTransition>> {
        Ok(self
            .inner
            .lock()
            .await
            .log
            .iter()
            .filter(|t| &t.name == name)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// In-memory connector registry + heartbeat log + hourly stats.
#[derive(Debug, Default)]
pub struct MemoryConnectorStore {
    inner: Mutex<MemoryConnectorInner>,
}

#[derive(Debug, Default)]
struct MemoryConnectorInner {
    registry: HashMap<(String, String), ConnectorRecord>,
    heartbeat_log: Vec<(DateTime<Utc>, ConnectorHeartbeat)>,
    stats_rows: u64,
}

impl MemoryConnectorStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hourly stats rows produced so far (test hook).
    pub async fn stats_rows(&self) -> u64 {
        self.inner.lock().await.stats_rows
    }
}

#[async_trait]
impl ConnectorStore for MemoryConnectorStore {
    async fn record_heartbeat(
        &self,
        heartbeat: &ConnectorHeartbeat,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().await;
        let key = (
            heartbeat.connector_type.clone(),
            heartbeat.endpoint_identity.clone(),
        );
        inner.heartbeat_log.push((at, heartbeat.clone()));
        match inner.registry.get_mut(&key) {
            Some(record) => {
                record.instance_id.clone_from(&heartbeat.instance_id);
                record.state = format!("{:?}", heartbeat.state).to_lowercase();
                record.counters.clone_from(&heartbeat.counters);
                record.checkpoint.clone_from(&heartbeat.checkpoint);
                record.last_seen_at = at;
                Ok(false)
            },
            None => {
                inner.registry.insert(
                    key,
                    ConnectorRecord {
                        connector_type: heartbeat.connector_type.clone(),
                        endpoint_identity: heartbeat.endpoint_identity.clone(),
                        instance_id: heartbeat.instance_id.clone(),
                        state: format!("{:?}", heartbeat.state).to_lowercase(),
                        counters: heartbeat.counters.clone(),
                        checkpoint: heartbeat.checkpoint.clone(),
                        first_seen_at: at,
                        last_seen_at: at,
                    },
                );
                Ok(true)
            },
        }
    }

    async fn get(
        &self,
        connector_type: &str,
        endpoint_identity: &str,
    ) -> StorageResult<Option<ConnectorRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .registry
            .get(&(connector_type.to_string(), endpoint_identity.to_string()))
            .cloned())
    }

    async fn list(&self) -> StorageResult<Vec<ConnectorRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner.registry.values().cloned().collect();
        records.sort_by(|a, b| {
            (&a.connector_type, &a.endpoint_identity)
                .cmp(&(&b.connector_type, &b.endpoint_identity))
        });
        Ok(records)
    }

    async fn rollup(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.heartbeat_log.len();
        inner.heartbeat_log.retain(|(at, _)| *at >= cutoff);
        let folded = (before - inner.heartbeat_log.len()) as u64;
        if folded > 0 {
            inner.stats_rows = inner.stats_rows.saturating_add(1);
        }
        Ok(folded)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// In-memory `pending_actions` + `approval_events` for one butler.
#[derive(Debug, Default)]
pub struct MemoryActionStore {
    inner: Mutex<MemoryActionInner>,
}

#[derive(Debug, Default)]
struct MemoryActionInner {
    actions: HashMap<ActionId, PendingActionRecord>,
    events: Vec<ApprovalEvent>,
}

impl MemoryActionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn insert(&self, record: PendingActionRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().await;
        let action_id = record.action_id;
        let created_at = record.created_at;
        if inner.actions.contains_key(&action_id) {
            return Err(StorageError::Conflict(format!("action {action_id} exists")));
        }
        inner.actions.insert(action_id, record);
        inner.events.push(ApprovalEvent {
            action_id,
            kind: "action_created".to_string(),
            detail: None,
            at: created_at,
        });
        Ok(())
    }

    async fn get(&self, action_id: ActionId) -> StorageResult<Option<PendingActionRecord>> {
        Ok(self.inner.lock().await.actions.get(&action_id).cloned())
    }

    async fn cas_decide(
        &self,
        action_id: ActionId,
        to: ActionStatus,
        decided_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.actions.get_mut(&action_id) else {
            return Ok(false);
        };
        if record.status != ActionStatus::Pending {
            return Ok(false);
        }
        record.status = to;
        record.decided_at = Some(decided_at);
        Ok(true)
    }

    async fn cas_mark_executed(
        &self,
        action_id: ActionId,
        result: Value,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.actions.get_mut(&action_id) else {
            return Ok(false);
        };
        if record.status != ActionStatus::Approved {
            return Ok(false);
        }
        record.status = ActionStatus::Executed;
        record.execution_result = Some(result);
        record.decided_at.get_or_insert(at);
        Ok(true)
    }

    async fn append_event(&self, event: ApprovalEvent) -> StorageResult<()> {
        self.inner.lock().await.events.push(event);
        Ok(())
    }

    async fn events(&self, action_id: ActionId) -> StorageResult<Vec<ApprovalEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.action_id == action_id)
            .cloned()
            .collect())
    }

    async fn expired_pending(&self, now: DateTime<Utc>) -> StorageResult<Vec<ActionId>> {
        Ok(self
            .inner
            .lock()
            .await
            .actions
            .values()
            .filter(|a| {
                a.status == ActionStatus::Pending
                    && a.expires_at.is_some_and(|deadline| deadline <= now)
            })
            .map(|a| a.action_id)
            .collect())
    }

    async fn list_pending(&self) -> StorageResult<Vec<PendingActionRecord>> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<_> = inner
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.created_at);
        Ok(pending)
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// In-memory `scheduled_tasks` for one butler.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn upsert(&self, record: TaskRecord) -> StorageResult<()> {
        let mut tasks = self.tasks.lock().await;
        let prior = tasks
            .get(&record.name)
            .map(|e| (e.last_run_at, e.next_run_at, e.cron.clone()));
        if let Some((last_run_at, next_run_at, prior_cron)) = prior {
            let name = record.name.clone();
            let mut updated = record;
            updated.last_run_at = last_run_at;
            // Keep the computed schedule unless the cron changed.
            if prior_cron == updated.cron {
                updated.next_run_at = next_run_at;
            }
            tasks.insert(name, updated);
        } else {
            tasks.insert(record.name.clone(), record);
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> StorageResult<Option<TaskRecord>> {
        Ok(self.tasks.lock().await.get(name).cloned())
    }

    async fn list_enabled(&self) -> StorageResult<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.enabled)
            .cloned()
            .collect())
    }

    async fn cas_fire(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_due: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(name) else {
            return Ok(false);
        };
        if task.next_run_at != Some(expected_due) {
            return Ok(false);
        }
        task.last_run_at = Some(fired_at);
        task.next_run_at = Some(next_due);
        Ok(true)
    }

    async fn set_next_due(&self, name: &str, next_due: DateTime<Utc>) -> StorageResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("task {name}")))?;
        task.next_run_at = Some(next_due);
        Ok(())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> StorageResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("task {name}")))?;
        task.enabled = enabled;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routing logs
// ---------------------------------------------------------------------------

/// In-memory `routing_log` + `fanout_execution_log`.
#[derive(Debug, Default)]
pub struct MemoryRoutingLogStore {
    inner: Mutex<MemoryRoutingLogInner>,
}

#[derive(Debug, Default)]
struct MemoryRoutingLogInner {
    routes: Vec<RoutingLogRecord>,
    fanouts: Vec<FanoutLogRecord>,
}

impl MemoryRoutingLogStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All route rows (test hook).
    pub async fn routes(&self) -> Vec<RoutingLogRecord> {
        self.inner.lock().await.routes.clone()
    }
}

#[async_trait]
impl RoutingLogStore for MemoryRoutingLogStore {
    async fn record_route(&self, record: RoutingLogRecord) -> StorageResult<()> {
        self.inner.lock().await.routes.push(record);
        Ok(())
    }

    async fn record_fanout(&self, record: FanoutLogRecord) -> StorageResult<()> {
        self.inner.lock().await.fanouts.push(record);
        Ok(())
    }

    async fn fanout_for_request(
        &self,
        request_id: RequestId,
    ) -> StorageResult<Vec<FanoutLogRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .fanouts
            .iter()
            .filter(|f| f.request_id == request_id)
            .cloned()
            .collect())
    }
}

/// Convenience bundle of shared in-memory stores for tests and `mem:` mode.
#[derive(Debug, Default)]
pub struct MemorySharedStores {
    /// Message inbox.
    pub inbox: Arc<MemoryInboxStore>,
    /// Ingress queue backing.
    pub queue: Arc<MemoryQueueStore>,
    /// Butler registry.
    pub registry: Arc<MemoryRegistryStore>,
    /// Connector registry.
    pub connectors: Arc<MemoryConnectorStore>,
    /// Routing + fanout logs.
    pub routing_log: Arc<MemoryRoutingLogStore>,
}

impl MemorySharedStores {
    /// Create an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RiskTier;
    use butlers_core::envelope::PolicyTier;

    fn inbox_record(dedupe_key: &str) -> NewInboxRecord {
        NewInboxRecord {
            request_id: RequestId::new(),
            dedupe_key: dedupe_key.to_string(),
            channel: "telegram".to_string(),
            provider: "telegram".to_string(),
            endpoint_identity: "bot:main".to_string(),
            sender_identity: "tg:1".to_string(),
            payload: serde_json::json!({"body": "hello"}),
            normalized_text: "hello".to_string(),
            policy_tier: PolicyTier::Default,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_inbox_dedupe_returns_original_id() {
        let store = MemoryInboxStore::new();
        let first = inbox_record("k1");
        let original_id = first.request_id;
        let (id, duplicate) = store.upsert(first).await.unwrap();
        assert_eq!(id, original_id);
        assert!(!duplicate);

        let (id2, duplicate2) = store.upsert(inbox_record("k1")).await.unwrap();
        assert_eq!(id2, original_id);
        assert!(duplicate2);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_complete_is_exactly_once() {
        let store = MemorySessionStore::new();
        let id = SessionId::new();
        store
            .insert_running(SessionRecord {
                session_id: id,
                butler_name: "health".into(),
                trigger_source: butlers_core::TriggerSource::External,
                prompt: "p".to_string(),
                model: None,
                status: SessionStatus::Running,
                created_at: Utc::now(),
                completed_at: None,
                duration_ms: None,
                tool_calls: Vec::new(),
                input_tokens: None,
                output_tokens: None,
                trace_id: None,
                error: None,
                parent_session_id: None,
            })
            .await
            .unwrap();

        let completion = SessionCompletion {
            status: SessionStatus::Completed,
            completed_at: Utc::now(),
            duration_ms: 12,
            tool_calls: Vec::new(),
            input_tokens: Some(10),
            output_tokens: Some(5),
            error: None,
        };
        assert!(store.complete(id, completion.clone()).await.unwrap());
        // Second terminal write loses.
        assert!(!store.complete(id, completion).await.unwrap());
    }

    #[tokio::test]
    async fn test_action_cas_single_winner() {
        let store = MemoryActionStore::new();
        let action_id = ActionId::new();
        store
            .insert(PendingActionRecord {
                action_id,
                butler: "health".into(),
                tool_name: "send_email".to_string(),
                tool_args: serde_json::json!({}),
                status: ActionStatus::Pending,
                risk_tier: RiskTier::High,
                created_at: Utc::now(),
                decided_at: None,
                expires_at: None,
                execution_result: None,
            })
            .await
            .unwrap();

        let now = Utc::now();
        assert!(store.cas_decide(action_id, ActionStatus::Approved, now).await.unwrap());
        assert!(!store.cas_decide(action_id, ActionStatus::Rejected, now).await.unwrap());
        let record = store.get(action_id).await.unwrap().unwrap();
        assert_eq!(record.status, ActionStatus::Approved);
    }

    #[tokio::test]
    async fn test_task_cas_fire_once_per_cycle() {
        let store = MemoryTaskStore::new();
        let due = Utc::now();
        store
            .upsert(TaskRecord {
                name: "sweep".to_string(),
                cron: "*/5 * * * *".to_string(),
                dispatch_mode: "job".to_string(),
                enabled: true,
                prompt: None,
                job_name: Some("registry_sweep".to_string()),
                job_args: None,
                last_run_at: None,
                next_run_at: Some(due),
            })
            .await
            .unwrap();

        let next = due + chrono::Duration::minutes(5);
        assert!(store.cas_fire("sweep", due, due, next).await.unwrap());
        // Same cycle again: expected_due no longer matches.
        assert!(!store.cas_fire("sweep", due, due, next).await.unwrap());
    }

    #[tokio::test]
    async fn test_registry_heartbeat_restores_stale_not_quarantined() {
        let store = MemoryRegistryStore::new();
        let name: ButlerName = "health".into();
        store
            .upsert_registration(RegistryRecord {
                name: name.clone(),
                endpoint_url: "http://127.0.0.1:8351".to_string(),
                route_contract_min: 1,
                route_contract_max: 1,
                capabilities: vec![],
                description: "health".to_string(),
                eligibility_state: EligibilityState::Active,
                last_heartbeat_at: Utc::now(),
                liveness_ttl_s: 180,
                quarantine_reason: None,
                first_seen_at: Utc::now(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        store.set_eligibility(&name, EligibilityState::Stale, "ttl_expired", now).await.unwrap();
        store.heartbeat(&name, now).await.unwrap();
        assert_eq!(
            store.get(&name).await.unwrap().unwrap().eligibility_state,
            EligibilityState::Active
        );

        store
            .set_eligibility(&name, EligibilityState::Quarantined, "repeated_failures", now)
            .await
            .unwrap();
        store.heartbeat(&name, now).await.unwrap();
        assert_eq!(
            store.get(&name).await.unwrap().unwrap().eligibility_state,
            EligibilityState::Quarantined
        );

        let log = store.eligibility_log(&name).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].reason, "health_restored");
    }

    #[tokio::test]
    async fn test_connector_auto_create_then_update() {
        let store = MemoryConnectorStore::new();
        let hb = ConnectorHeartbeat::new("telegram", "bot:main", "inst-1", Utc::now());
        let now = Utc::now();
        assert!(store.record_heartbeat(&hb, now).await.unwrap());
        assert!(!store.record_heartbeat(&hb, now).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
        let record = store.get("telegram", "bot:main").await.unwrap().unwrap();
        assert_eq!(record.first_seen_at, now);
    }

    #[tokio::test]
    async fn test_queue_lease_cycle() {
        let store = MemoryQueueStore::new();
        let id = IngressId::new();
        let now = Utc::now();
        store
            .insert(QueueItem {
                ingress_id: id,
                request_id: RequestId::new(),
                priority_tier: PolicyTier::Interactive,
                enqueued_at: now - chrono::Duration::minutes(10),
                leased_by: None,
                leased_until: None,
                attempts: 0,
            })
            .await
            .unwrap();

        let until = now + chrono::Duration::minutes(5);
        assert!(store.try_lease(id, "worker-0", now, until).await.unwrap());
        // Lease held: second worker loses, and the scanner does not see it.
        assert!(!store.try_lease(id, "worker-1", now, until).await.unwrap());
        assert!(store.stale(now, now, 10).await.unwrap().is_empty());
        // After expiry the scanner surfaces it and a worker can re-lease.
        let later = until + chrono::Duration::seconds(1);
        let stale = store.stale(later, later, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(store.try_lease(id, "worker-1", later, later + chrono::Duration::minutes(5)).await.unwrap());
        assert_eq!(store.stale(later, later, 10).await.unwrap().len(), 0);

        store.complete(id).await.unwrap();
        assert_eq!(store.depth().await.unwrap(), 0);
    }
}
