//! Postgres store implementations.
//!
//! Shared-schema stores qualify table names with `shared.`; per-butler
//! stores rely on the pool's `search_path` and use unqualified names. All
//! queries are runtime-bound (no compile-time database required).

use async_trait::async_trait;
use butlers_core::envelope::PolicyTier;
use butlers_core::{ActionId, ButlerName, ConnectorHeartbeat, IngressId, RequestId, SessionId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::records::{
    ActionStatus, ApprovalEvent, ConnectorRecord, EligibilityState, EligibilityTransition,
    FanoutLogRecord, InboxRecord, InboxStatus, NewInboxRecord, PendingActionRecord, QueueItem,
    RegistryRecord, RiskTier, RoutingLogRecord, SessionCompletion, SessionRecord, SessionStatus,
    TaskRecord, TriggerAuditRecord,
};
use crate::stores::{
    ActionStore, ConnectorStore, InboxStore, QueueStore, RegistryStore, RoutingLogStore,
    SessionStore, StateStore, TaskStore,
};

fn tier_str(tier: PolicyTier) -> &'static str {
    match tier {
        PolicyTier::Default => "default",
        PolicyTier::Interactive => "interactive",
        PolicyTier::HighPriority => "high_priority",
    }
}

fn tier_parse(raw: &str) -> PolicyTier {
    match raw {
        "interactive" => PolicyTier::Interactive,
        "high_priority" => PolicyTier::HighPriority,
        _ => PolicyTier::Default,
    }
}

fn bad_column(table: &str, column: &str, raw: &str) -> StorageError {
    StorageError::Conflict(format!("{table}.{column} holds unexpected value '{raw}'"))
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// Postgres `shared.message_inbox`.
#[derive(Debug)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    /// Create a store over the switchboard pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type InboxRow = (
    Uuid,
    String,
    String,
    String,
    String,
    String,
    Value,
    String,
    String,
    DateTime<Utc>,
    Option<Value>,
    Option<Value>,
    String,
);

fn inbox_from_row(row: InboxRow) -> StorageResult<InboxRecord> {
    let status = InboxStatus::parse(&row.12)
        .ok_or_else(|| bad_column("message_inbox", "status", &row.12))?;
    Ok(InboxRecord {
        new: NewInboxRecord {
            request_id: RequestId::from_uuid(row.0),
            dedupe_key: row.1,
            channel: row.2,
            provider: row.3,
            endpoint_identity: row.4,
            sender_identity: row.5,
            payload: row.6,
            normalized_text: row.7,
            policy_tier: tier_parse(&row.8),
            observed_at: row.9,
        },
        classification: row.10,
        routing_results: row.11,
        status,
    })
}

const INBOX_COLUMNS: &str = "request_id, dedupe_key, channel, provider, endpoint_identity, \
     sender_identity, payload, normalized_text, policy_tier, observed_at, classification, \
     routing_results, status";

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn upsert(&self, record: NewInboxRecord) -> StorageResult<(RequestId, bool)> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO shared.message_inbox (request_id, dedupe_key, channel, provider, \
             endpoint_identity, sender_identity, payload, normalized_text, policy_tier, \
             observed_at, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'accepted') \
             ON CONFLICT (dedupe_key) DO NOTHING \
             RETURNING request_id",
        )
        .bind(record.request_id.0)
        .bind(&record.dedupe_key)
        .bind(&record.channel)
        .bind(&record.provider)
        .bind(&record.endpoint_identity)
        .bind(&record.sender_identity)
        .bind(&record.payload)
        .bind(&record.normalized_text)
        .bind(tier_str(record.policy_tier))
        .bind(record.observed_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok((RequestId::from_uuid(id), false));
        }

        let (existing,): (Uuid,) =
            sqlx::query_as("SELECT request_id FROM shared.message_inbox WHERE dedupe_key = $1")
                .bind(&record.dedupe_key)
                .fetch_one(&self.pool)
                .await?;
        Ok((RequestId::from_uuid(existing), true))
    }

    async fn get(&self, request_id: RequestId) -> StorageResult<Option<InboxRecord>> {
        let row: Option<InboxRow> = sqlx::query_as(&format!(
            "SELECT {INBOX_COLUMNS} FROM shared.message_inbox WHERE request_id = $1"
        ))
        .bind(request_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(inbox_from_row).transpose()
    }

    async fn set_classification(
        &self,
        request_id: RequestId,
        classification: Value,
    ) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE shared.message_inbox SET classification = $2 WHERE request_id = $1")
                .bind(request_id.0)
                .bind(&classification)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("inbox {request_id}")));
        }
        Ok(())
    }

    async fn set_routing_results(
        &self,
        request_id: RequestId,
        results: Value,
        status: InboxStatus,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE shared.message_inbox SET routing_results = $2, status = $3 WHERE request_id = $1",
        )
        .bind(request_id.0)
        .bind(&results)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("inbox {request_id}")));
        }
        Ok(())
    }

    async fn set_status(&self, request_id: RequestId, status: InboxStatus) -> StorageResult<()> {
        let result = sqlx::query("UPDATE shared.message_inbox SET status = $2 WHERE request_id = $1")
            .bind(request_id.0)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("inbox {request_id}")));
        }
        Ok(())
    }

    async fn count(&self) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM shared.message_inbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Postgres `shared.ingress_queue`.
#[derive(Debug)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    /// Create a store over the switchboard pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type QueueRow = (
    Uuid,
    Uuid,
    String,
    DateTime<Utc>,
    Option<String>,
    Option<DateTime<Utc>>,
    i32,
);

fn queue_from_row(row: QueueRow) -> QueueItem {
    QueueItem {
        ingress_id: IngressId::from_uuid(row.0),
        request_id: RequestId::from_uuid(row.1),
        priority_tier: tier_parse(&row.2),
        enqueued_at: row.3,
        leased_by: row.4,
        leased_until: row.5,
        attempts: row.6,
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn insert(&self, item: QueueItem) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO shared.ingress_queue \
             (ingress_id, request_id, priority_tier, enqueued_at, leased_by, leased_until, attempts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (ingress_id) DO NOTHING",
        )
        .bind(item.ingress_id.0)
        .bind(item.request_id.0)
        .bind(tier_str(item.priority_tier))
        .bind(item.enqueued_at)
        .bind(&item.leased_by)
        .bind(item.leased_until)
        .bind(item.attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_lease(
        &self,
        ingress_id: IngressId,
        worker: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE shared.ingress_queue \
             SET leased_by = $2, leased_until = $3, attempts = attempts + 1 \
             WHERE ingress_id = $1 AND (leased_until IS NULL OR leased_until <= $4)",
        )
        .bind(ingress_id.0)
        .bind(worker)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn stale(
        &self,
        grace_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT ingress_id, request_id, priority_tier, enqueued_at, leased_by, \
                    leased_until, attempts \
             FROM shared.ingress_queue \
             WHERE enqueued_at <= $1 AND (leased_until IS NULL OR leased_until <= $2) \
             ORDER BY enqueued_at \
             LIMIT $3",
        )
        .bind(grace_cutoff)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(queue_from_row).collect())
    }

    async fn complete(&self, ingress_id: IngressId) -> StorageResult<()> {
        sqlx::query("DELETE FROM shared.ingress_queue WHERE ingress_id = $1")
            .bind(ingress_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, ingress_id: IngressId) -> StorageResult<()> {
        sqlx::query(
            "UPDATE shared.ingress_queue SET leased_by = NULL, leased_until = NULL \
             WHERE ingress_id = $1",
        )
        .bind(ingress_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn depth(&self) -> StorageResult<i64> {
        let (depth,): (i64,) = sqlx::query_as("SELECT count(*) FROM shared.ingress_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(depth)
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Postgres per-butler `sessions` + `trigger_log`.
#[derive(Debug)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Create a store over one butler's pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type SessionRow = (
    Uuid,
    String,
    String,
    String,
    Option<String>,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<i64>,
    Value,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<Uuid>,
);

fn session_from_row(row: SessionRow) -> StorageResult<SessionRecord> {
    let trigger_source = serde_json::from_value(Value::String(row.2.clone()))
        .map_err(|_| bad_column("sessions", "trigger_source", &row.2))?;
    let status =
        SessionStatus::parse(&row.5).ok_or_else(|| bad_column("sessions", "status", &row.5))?;
    let tool_calls = match row.9 {
        Value::Array(calls) => calls,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    Ok(SessionRecord {
        session_id: SessionId::from_uuid(row.0),
        butler_name: ButlerName::from(row.1),
        trigger_source,
        prompt: row.3,
        model: row.4,
        status,
        created_at: row.6,
        completed_at: row.7,
        duration_ms: row.8,
        tool_calls,
        input_tokens: row.10,
        output_tokens: row.11,
        trace_id: row.12,
        error: row.13,
        parent_session_id: row.14.map(SessionId::from_uuid),
    })
}

const SESSION_COLUMNS: &str = "session_id, butler_name, trigger_source, prompt, model, status, \
     created_at, completed_at, duration_ms, tool_calls, input_tokens, output_tokens, trace_id, \
     error, parent_session_id";

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert_running(&self, record: SessionRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO sessions (session_id, butler_name, trigger_source, prompt, model, \
             status, created_at, tool_calls, trace_id, parent_session_id) \
             VALUES ($1, $2, $3, $4, $5, 'running', $6, $7, $8, $9)",
        )
        .bind(record.session_id.0)
        .bind(record.butler_name.as_str())
        .bind(record.trigger_source.as_str())
        .bind(&record.prompt)
        .bind(&record.model)
        .bind(record.created_at)
        .bind(Value::Array(record.tool_calls.clone()))
        .bind(&record.trace_id)
        .bind(record.parent_session_id.map(|id| id.0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(
        &self,
        session_id: SessionId,
        completion: SessionCompletion,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions \
             SET status = $2, completed_at = $3, duration_ms = $4, \
                 tool_calls = tool_calls || $5::jsonb, input_tokens = $6, output_tokens = $7, \
                 error = $8 \
             WHERE session_id = $1 AND status = 'running'",
        )
        .bind(session_id.0)
        .bind(completion.status.as_str())
        .bind(completion.completed_at)
        .bind(completion.duration_ms)
        .bind(Value::Array(completion.tool_calls))
        .bind(completion.input_tokens)
        .bind(completion.output_tokens)
        .bind(&completion.error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_tool_call(&self, session_id: SessionId, call: Value) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET tool_calls = tool_calls || $2::jsonb WHERE session_id = $1",
        )
        .bind(session_id.0)
        .bind(Value::Array(vec![call]))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(session_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(session_from_row).transpose()
    }

    async fn list_recent(&self, limit: i64) -> StorageResult<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    async fn children(&self, parent: SessionId) -> StorageResult<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE parent_session_id = $1 \
             ORDER BY created_at"
        ))
        .bind(parent.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    async fn record_trigger(&self, record: TriggerAuditRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO trigger_log (butler_name, trigger_source, session_id, outcome, at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.butler_name.as_str())
        .bind(record.trigger_source.as_str())
        .bind(record.session_id.map(|id| id.0))
        .bind(&record.outcome)
        .bind(record.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State KV
// ---------------------------------------------------------------------------

/// Postgres per-butler `state` table.
#[derive(Debug)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Create a store over one butler's pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let row: Option<(Value,)> = sqlx::query_as("SELECT value FROM state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO state (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM state WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM state ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Postgres `shared.butler_registry` + `shared.eligibility_log`.
#[derive(Debug)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    /// Create a store over the switchboard pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn log_transition(
        &self,
        name: &ButlerName,
        from: EligibilityState,
        to: EligibilityState,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO shared.eligibility_log (name, from_state, to_state, reason, at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(name.as_str())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_state(&self, name: &ButlerName) -> StorageResult<Option<EligibilityState>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT eligibility_state FROM shared.butler_registry WHERE name = $1")
                .bind(name.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(raw,)| {
            EligibilityState::parse(&raw)
                .ok_or_else(|| bad_column("butler_registry", "eligibility_state", &raw))
        })
        .transpose()
    }
}

type RegistryRow = (
    String,
    String,
    i32,
    i32,
    Value,
    String,
    String,
    DateTime<Utc>,
    i64,
    Option<String>,
    DateTime<Utc>,
);

fn registry_from_row(row: RegistryRow) -> StorageResult<RegistryRecord> {
    let eligibility_state = EligibilityState::parse(&row.6)
        .ok_or_else(|| bad_column("butler_registry", "eligibility_state", &row.6))?;
    let capabilities: Vec<String> = serde_json::from_value(row.4)?;
    Ok(RegistryRecord {
        name: ButlerName::from(row.0),
        endpoint_url: row.1,
        route_contract_min: row.2,
        route_contract_max: row.3,
        capabilities,
        description: row.5,
        eligibility_state,
        last_heartbeat_at: row.7,
        liveness_ttl_s: row.8,
        quarantine_reason: row.9,
        first_seen_at: row.10,
    })
}

const REGISTRY_COLUMNS: &str = "name, endpoint_url, route_contract_min, route_contract_max, \
     capabilities, description, eligibility_state, last_heartbeat_at, liveness_ttl_s, \
     quarantine_reason, first_seen_at";

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn upsert_registration(&self, record: RegistryRecord) -> StorageResult<()> {
        let was = self.current_state(&record.name).await?;
        sqlx::query(
            "INSERT INTO shared.butler_registry \
             (name, endpoint_url, route_contract_min, route_contract_max, capabilities, \
              description, eligibility_state, last_heartbeat_at, liveness_ttl_s, \
              quarantine_reason, first_seen_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (name) DO UPDATE SET \
                endpoint_url = EXCLUDED.endpoint_url, \
                route_contract_min = EXCLUDED.route_contract_min, \
                route_contract_max = EXCLUDED.route_contract_max, \
                capabilities = EXCLUDED.capabilities, \
                description = EXCLUDED.description, \
                last_heartbeat_at = EXCLUDED.last_heartbeat_at, \
                liveness_ttl_s = EXCLUDED.liveness_ttl_s",
        )
        .bind(record.name.as_str())
        .bind(&record.endpoint_url)
        .bind(record.route_contract_min)
        .bind(record.route_contract_max)
        .bind(serde_json::to_value(&record.capabilities)?)
        .bind(&record.description)
        .bind(record.eligibility_state.as_str())
        .bind(record.last_heartbeat_at)
        .bind(record.liveness_ttl_s)
        .bind(&record.quarantine_reason)
        .bind(record.first_seen_at)
        .execute(&self.pool)
        .await?;

        if was == Some(EligibilityState::Stale) {
            self.set_eligibility(&record.name, EligibilityState::Active, "re_registered", Utc::now())
                .await?;
        }
        Ok(())
    }

    async fn heartbeat(&self, name: &ButlerName, at: DateTime<Utc>) -> StorageResult<()> {
        let was = self
            .current_state(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("registry entry {name}")))?;
        sqlx::query("UPDATE shared.butler_registry SET last_heartbeat_at = $2 WHERE name = $1")
            .bind(name.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;
        if was == EligibilityState::Stale {
            self.set_eligibility(name, EligibilityState::Active, "health_restored", at).await?;
        }
        Ok(())
    }

    async fn get(&self, name: &ButlerName) -> StorageResult<Option<RegistryRecord>> {
        let row: Option<RegistryRow> = sqlx::query_as(&format!(
            "SELECT {REGISTRY_COLUMNS} FROM shared.butler_registry WHERE name = $1"
        ))
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(registry_from_row).transpose()
    }

    async fn list(&self) -> StorageResult<Vec<RegistryRecord>> {
        let rows: Vec<RegistryRow> = sqlx::query_as(&format!(
            "SELECT {REGISTRY_COLUMNS} FROM shared.butler_registry ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(registry_from_row).collect()
    }

    async fn set_eligibility(
        &self,
        name: &ButlerName,
        to: EligibilityState,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let was = self
            .current_state(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("registry entry {name}")))?;
        if was == to {
            return Ok(());
        }
        let quarantine_reason = (to == EligibilityState::Quarantined).then(|| reason.to_string());
        sqlx::query(
            "UPDATE shared.butler_registry \
             SET eligibility_state = $2, quarantine_reason = $3 WHERE name = $1",
        )
        .bind(name.as_str())
        .bind(to.as_str())
        .bind(&quarantine_reason)
        .execute(&self.pool)
        .await?;
        self.log_transition(name, was, to, reason, at).await
    }

    async fn eligibility_log(
        &self,
        name: &ButlerName,
    ) -> StorageResult<Vec<EligibilityTransition>> {
        let rows: Vec<(String, String, String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT name, from_state, to_state, reason, at FROM shared.eligibility_log \
             WHERE name = $1 ORDER BY id",
        )
        .bind(name.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(name, from, to, reason, at)| {
                let from = EligibilityState::parse(&from)
                    .ok_or_else(|| bad_column("eligibility_log", "from_state", &from))?;
                let to = EligibilityState::parse(&to)
                    .ok_or_else(|| bad_column("eligibility_log", "to_state", &to))?;
                Ok(EligibilityTransition {
                    name: ButlerName::from(name),
                    from,
                    to,
                    reason,
                    at,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// Postgres connector registry + heartbeat log + hourly stats.
#[derive(Debug)]
pub struct PgConnectorStore {
    pool: PgPool,
}

impl PgConnectorStore {
    /// Create a store over the switchboard pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn connector_state_str(state: butlers_core::ConnectorState) -> &'static str {
    match state {
        butlers_core::ConnectorState::Healthy => "healthy",
        butlers_core::ConnectorState::Degraded => "degraded",
        butlers_core::ConnectorState::Error => "error",
    }
}

#[async_trait]
impl ConnectorStore for PgConnectorStore {
    async fn record_heartbeat(
        &self,
        heartbeat: &ConnectorHeartbeat,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let counters = serde_json::to_value(&heartbeat.counters)?;
        sqlx::query(
            "INSERT INTO shared.connector_heartbeat_log \
             (connector_type, endpoint_identity, instance_id, state, counters, sent_at, received_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&heartbeat.connector_type)
        .bind(&heartbeat.endpoint_identity)
        .bind(&heartbeat.instance_id)
        .bind(connector_state_str(heartbeat.state))
        .bind(&counters)
        .bind(heartbeat.sent_at)
        .bind(at)
        .execute(&self.pool)
        .await?;

        // xmax = 0 distinguishes a fresh insert from a conflict-update.
        let (inserted,): (bool,) = sqlx::query_as(
            "INSERT INTO shared.connector_registry \
             (connector_type, endpoint_identity, instance_id, state, counters, checkpoint, \
              first_seen_at, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
             ON CONFLICT (connector_type, endpoint_identity) DO UPDATE SET \
                instance_id = EXCLUDED.instance_id, \
                state = EXCLUDED.state, \
                counters = EXCLUDED.counters, \
                checkpoint = COALESCE(EXCLUDED.checkpoint, shared.connector_registry.checkpoint), \
                last_seen_at = EXCLUDED.last_seen_at \
             RETURNING (xmax = 0)",
        )
        .bind(&heartbeat.connector_type)
        .bind(&heartbeat.endpoint_identity)
        .bind(&heartbeat.instance_id)
        .bind(connector_state_str(heartbeat.state))
        .bind(&counters)
        .bind(&heartbeat.checkpoint)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }

    async fn get(
        &self,
        connector_type: &str,
        endpoint_identity: &str,
    ) -> StorageResult<Option<ConnectorRecord>> {
        let row: Option<(String, String, String, String, Value, Option<Value>, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT connector_type, endpoint_identity, instance_id, state, counters, \
                 checkpoint, first_seen_at, last_seen_at \
                 FROM shared.connector_registry \
                 WHERE connector_type = $1 AND endpoint_identity = $2",
            )
            .bind(connector_type)
            .bind(endpoint_identity)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(ConnectorRecord {
                connector_type: r.0,
                endpoint_identity: r.1,
                instance_id: r.2,
                state: r.3,
                counters: serde_json::from_value(r.4)?,
                checkpoint: r.5,
                first_seen_at: r.6,
                last_seen_at: r.7,
            })
        })
        .transpose()
    }

    async fn list(&self) -> StorageResult<Vec<ConnectorRecord>> {
        let rows: Vec<(String, String, String, String, Value, Option<Value>, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT connector_type, endpoint_identity, instance_id, state, counters, \
                 checkpoint, first_seen_at, last_seen_at \
                 FROM shared.connector_registry ORDER BY connector_type, endpoint_identity",
            )
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(ConnectorRecord {
                    connector_type: r.0,
                    endpoint_identity: r.1,
                    instance_id: r.2,
                    state: r.3,
                    counters: serde_json::from_value(r.4)?,
                    checkpoint: r.5,
                    first_seen_at: r.6,
                    last_seen_at: r.7,
                })
            })
            .collect()
    }

    async fn rollup(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        sqlx::query(
            "INSERT INTO shared.connector_stats_hourly \
             (connector_type, endpoint_identity, hour, counters, heartbeats) \
             SELECT connector_type, endpoint_identity, date_trunc('hour', sent_at), \
                    (array_agg(counters ORDER BY sent_at DESC))[1], count(*)::int \
             FROM shared.connector_heartbeat_log \
             WHERE received_at < $1 \
             GROUP BY 1, 2, 3 \
             ON CONFLICT (connector_type, endpoint_identity, hour) DO UPDATE SET \
                counters = EXCLUDED.counters, \
                heartbeats = shared.connector_stats_hourly.heartbeats + EXCLUDED.heartbeats",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = sqlx::query("DELETE FROM shared.connector_heartbeat_log WHERE received_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Postgres per-butler `pending_actions` + `approval_events`.
#[derive(Debug)]
pub struct PgActionStore {
    pool: PgPool,
}

impl PgActionStore {
    /// Create a store over one butler's pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type ActionRow = (
    Uuid,
    String,
    String,
    Value,
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<Value>,
);

fn action_from_row(row: ActionRow) -> StorageResult<PendingActionRecord> {
    let status =
        ActionStatus::parse(&row.4).ok_or_else(|| bad_column("pending_actions", "status", &row.4))?;
    let risk_tier =
        RiskTier::parse(&row.5).ok_or_else(|| bad_column("pending_actions", "risk_tier", &row.5))?;
    Ok(PendingActionRecord {
        action_id: ActionId::from_uuid(row.0),
        butler: ButlerName::from(row.1),
        tool_name: row.2,
        tool_args: row.3,
        status,
        risk_tier,
        created_at: row.6,
        decided_at: row.7,
        expires_at: row.8,
        execution_result: row.9,
    })
}

const ACTION_COLUMNS: &str = "action_id, butler, tool_name, tool_args, status, risk_tier, \
     created_at, decided_at, expires_at, execution_result";

#[async_trait]
impl ActionStore for PgActionStore {
    async fn insert(&self, record: PendingActionRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO pending_actions \
             (action_id, butler, tool_name, tool_args, status, risk_tier, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.action_id.0)
        .bind(record.butler.as_str())
        .bind(&record.tool_name)
        .bind(&record.tool_args)
        .bind(record.status.as_str())
        .bind(record.risk_tier.as_str())
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        self.append_event(ApprovalEvent {
            action_id: record.action_id,
            kind: "action_created".to_string(),
            detail: None,
            at: record.created_at,
        })
        .await
    }

    async fn get(&self, action_id: ActionId) -> StorageResult<Option<PendingActionRecord>> {
        let row: Option<ActionRow> = sqlx::query_as(&format!(
            "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE action_id = $1"
        ))
        .bind(action_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(action_from_row).transpose()
    }

    async fn cas_decide(
        &self,
        action_id: ActionId,
        to: ActionStatus,
        decided_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE pending_actions SET status = $2, decided_at = $3 \
             WHERE action_id = $1 AND status = 'pending'",
        )
        .bind(action_id.0)
        .bind(to.as_str())
        .bind(decided_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cas_mark_executed(
        &self,
        action_id: ActionId,
        result: Value,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let outcome = sqlx::query(
            "UPDATE pending_actions \
             SET status = 'executed', execution_result = $2, decided_at = COALESCE(decided_at, $3) \
             WHERE action_id = $1 AND status = 'approved'",
        )
        .bind(action_id.0)
        .bind(&result)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn append_event(&self, event: ApprovalEvent) -> StorageResult<()> {
        sqlx::query("INSERT INTO approval_events (action_id, kind, detail, at) VALUES ($1, $2, $3, $4)")
            .bind(event.action_id.0)
            .bind(&event.kind)
            .bind(&event.detail)
            .bind(event.at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn events(&self, action_id: ActionId) -> StorageResult<Vec<ApprovalEvent>> {
        let rows: Vec<(Uuid, String, Option<Value>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT action_id, kind, detail, at FROM approval_events \
             WHERE action_id = $1 ORDER BY id",
        )
        .bind(action_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, kind, detail, at)| ApprovalEvent {
                action_id: ActionId::from_uuid(id),
                kind,
                detail,
                at,
            })
            .collect())
    }

    async fn expired_pending(&self, now: DateTime<Utc>) -> StorageResult<Vec<ActionId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT action_id FROM pending_actions \
             WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| ActionId::from_uuid(id)).collect())
    }

    async fn list_pending(&self) -> StorageResult<Vec<PendingActionRecord>> {
        let rows: Vec<ActionRow> = sqlx::query_as(&format!(
            "SELECT {ACTION_COLUMNS} FROM pending_actions WHERE status = 'pending' \
             ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(action_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Postgres per-butler `scheduled_tasks`.
#[derive(Debug)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Create a store over one butler's pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type TaskRow = (
    String,
    String,
    String,
    bool,
    Option<String>,
    Option<String>,
    Option<Value>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn task_from_row(row: TaskRow) -> TaskRecord {
    TaskRecord {
        name: row.0,
        cron: row.1,
        dispatch_mode: row.2,
        enabled: row.3,
        prompt: row.4,
        job_name: row.5,
        job_args: row.6,
        last_run_at: row.7,
        next_run_at: row.8,
    }
}

const TASK_COLUMNS: &str =
    "name, cron, dispatch_mode, enabled, prompt, job_name, job_args, last_run_at, next_run_at";

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn upsert(&self, record: TaskRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO scheduled_tasks \
             (name, cron, dispatch_mode, enabled, prompt, job_name, job_args, last_run_at, next_run_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (name) DO UPDATE SET \
                cron = EXCLUDED.cron, \
                dispatch_mode = EXCLUDED.dispatch_mode, \
                enabled = EXCLUDED.enabled, \
                prompt = EXCLUDED.prompt, \
                job_name = EXCLUDED.job_name, \
                job_args = EXCLUDED.job_args, \
                next_run_at = CASE WHEN scheduled_tasks.cron = EXCLUDED.cron \
                    THEN scheduled_tasks.next_run_at ELSE EXCLUDED.next_run_at END",
        )
        .bind(&record.name)
        .bind(&record.cron)
        .bind(&record.dispatch_mode)
        .bind(record.enabled)
        .bind(&record.prompt)
        .bind(&record.job_name)
        .bind(&record.job_args)
        .bind(record.last_run_at)
        .bind(record.next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> StorageResult<Option<TaskRecord>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(task_from_row))
    }

    async fn list_enabled(&self) -> StorageResult<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE enabled ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(task_from_row).collect())
    }

    async fn cas_fire(
        &self,
        name: &str,
        expected_due: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_due: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET last_run_at = $3, next_run_at = $4 \
             WHERE name = $1 AND next_run_at = $2",
        )
        .bind(name)
        .bind(expected_due)
        .bind(fired_at)
        .bind(next_due)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_next_due(&self, name: &str, next_due: DateTime<Utc>) -> StorageResult<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET next_run_at = $2 WHERE name = $1")
            .bind(name)
            .bind(next_due)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task {name}")));
        }
        Ok(())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> StorageResult<()> {
        let result = sqlx::query("UPDATE scheduled_tasks SET enabled = $2 WHERE name = $1")
            .bind(name)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task {name}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routing logs
// ---------------------------------------------------------------------------

/// Postgres `shared.routing_log` + `shared.fanout_execution_log`.
#[derive(Debug)]
pub struct PgRoutingLogStore {
    pool: PgPool,
}

impl PgRoutingLogStore {
    /// Create a store over the switchboard pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoutingLogStore for PgRoutingLogStore {
    async fn record_route(&self, record: RoutingLogRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO shared.routing_log (request_id, target, tool, outcome, duration_ms, at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.request_id.map(|id| id.0))
        .bind(record.target.as_str())
        .bind(&record.tool)
        .bind(&record.outcome)
        .bind(record.duration_ms)
        .bind(record.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_fanout(&self, record: FanoutLogRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO shared.fanout_execution_log \
             (request_id, subrequest_id, butler, outcome, detail, at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.request_id.0)
        .bind(&record.subrequest_id)
        .bind(record.butler.as_str())
        .bind(&record.outcome)
        .bind(&record.detail)
        .bind(record.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fanout_for_request(
        &self,
        request_id: RequestId,
    ) -> StorageResult<Vec<FanoutLogRecord>> {
        let rows: Vec<(Uuid, String, String, String, Option<Value>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT request_id, subrequest_id, butler, outcome, detail, at \
                 FROM shared.fanout_execution_log WHERE request_id = $1 ORDER BY id",
            )
            .bind(request_id.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, subrequest_id, butler, outcome, detail, at)| FanoutLogRecord {
                request_id: RequestId::from_uuid(id),
                subrequest_id,
                butler: ButlerName::from(butler),
                outcome,
                detail,
                at,
            })
            .collect())
    }
}
