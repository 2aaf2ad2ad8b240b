//! Migration chains.
//!
//! Three chain kinds run in order at startup: the core chain (shared
//! schema), one chain per butler schema, and one chain per enabled module.
//! Applied revisions are tracked in `shared.schema_migrations`; a chain is
//! re-runnable and applies only revisions it has not seen.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// One migration step.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Revision id, unique within its chain, applied in array order.
    pub revision: &'static str,
    /// DDL/DML to run.
    pub sql: String,
}

/// Runs migration chains against one pool.
#[derive(Debug)]
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    /// Create a runner.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensure the bookkeeping table exists.
    async fn ensure_tracking(&self) -> StorageResult<()> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS shared")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS shared.schema_migrations (
                chain TEXT NOT NULL,
                revision TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (chain, revision)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Run one chain, applying unseen revisions in order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Migration`] naming the failing revision; the
    /// chain stops there and already-applied revisions stay recorded.
    pub async fn run_chain(&self, chain: &str, migrations: &[Migration]) -> StorageResult<u32> {
        self.ensure_tracking().await?;
        let mut applied = 0_u32;
        for migration in migrations {
            let seen: Option<(String,)> = sqlx::query_as(
                "SELECT revision FROM shared.schema_migrations WHERE chain = $1 AND revision = $2",
            )
            .bind(chain)
            .bind(migration.revision)
            .fetch_optional(&self.pool)
            .await?;
            if seen.is_some() {
                debug!(chain, revision = migration.revision, "migration already applied");
                continue;
            }

            // raw_sql uses the simple protocol so a revision may carry
            // multiple statements (table + index, function + trigger).
            sqlx::raw_sql(&migration.sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration {
                    chain: chain.to_string(),
                    revision: migration.revision.to_string(),
                    reason: e.to_string(),
                })?;
            sqlx::query(
                "INSERT INTO shared.schema_migrations (chain, revision) VALUES ($1, $2)",
            )
            .bind(chain)
            .bind(migration.revision)
            .execute(&self.pool)
            .await?;
            applied = applied.saturating_add(1);
            info!(chain, revision = migration.revision, "migration applied");
        }
        Ok(applied)
    }
}

/// The core chain: shared-schema tables owned by the switchboard.
#[must_use]
pub fn core_chain() -> Vec<Migration> {
    vec![
        Migration {
            revision: "0001_shared_schema",
            sql: "CREATE SCHEMA IF NOT EXISTS shared".to_string(),
        },
        Migration {
            revision: "0002_butler_secrets",
            sql: "CREATE TABLE IF NOT EXISTS shared.butler_secrets (
                butler_name TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (butler_name, name)
            )"
            .to_string(),
        },
        Migration {
            revision: "0003_butler_registry",
            sql: "CREATE TABLE IF NOT EXISTS shared.butler_registry (
                name TEXT PRIMARY KEY,
                endpoint_url TEXT NOT NULL,
                route_contract_min INT NOT NULL DEFAULT 1,
                route_contract_max INT NOT NULL DEFAULT 1,
                capabilities JSONB NOT NULL DEFAULT '[]'::jsonb,
                description TEXT NOT NULL DEFAULT '',
                eligibility_state TEXT NOT NULL DEFAULT 'active',
                last_heartbeat_at TIMESTAMPTZ NOT NULL,
                liveness_ttl_s BIGINT NOT NULL,
                quarantine_reason TEXT,
                first_seen_at TIMESTAMPTZ NOT NULL
            )"
            .to_string(),
        },
        Migration {
            revision: "0004_eligibility_log",
            sql: "CREATE TABLE IF NOT EXISTS shared.eligibility_log (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                reason TEXT NOT NULL,
                at TIMESTAMPTZ NOT NULL
            )"
            .to_string(),
        },
        Migration {
            revision: "0005_message_inbox",
            sql: "CREATE TABLE IF NOT EXISTS shared.message_inbox (
                request_id UUID PRIMARY KEY,
                dedupe_key TEXT NOT NULL,
                channel TEXT NOT NULL,
                provider TEXT NOT NULL,
                endpoint_identity TEXT NOT NULL,
                sender_identity TEXT NOT NULL,
                payload JSONB NOT NULL,
                normalized_text TEXT NOT NULL DEFAULT '',
                policy_tier TEXT NOT NULL DEFAULT 'default',
                observed_at TIMESTAMPTZ NOT NULL,
                classification JSONB,
                routing_results JSONB,
                status TEXT NOT NULL DEFAULT 'accepted'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS message_inbox_dedupe_key
                ON shared.message_inbox (dedupe_key)"
                .to_string(),
        },
        Migration {
            revision: "0006_ingress_queue",
            sql: "CREATE TABLE IF NOT EXISTS shared.ingress_queue (
                ingress_id UUID PRIMARY KEY,
                request_id UUID NOT NULL,
                priority_tier TEXT NOT NULL DEFAULT 'default',
                enqueued_at TIMESTAMPTZ NOT NULL,
                leased_by TEXT,
                leased_until TIMESTAMPTZ,
                attempts INT NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS ingress_queue_enqueued_at
                ON shared.ingress_queue (enqueued_at)"
                .to_string(),
        },
        Migration {
            revision: "0007_routing_log",
            sql: "CREATE TABLE IF NOT EXISTS shared.routing_log (
                id BIGSERIAL PRIMARY KEY,
                request_id UUID,
                target TEXT NOT NULL,
                tool TEXT NOT NULL,
                outcome TEXT NOT NULL,
                duration_ms BIGINT NOT NULL,
                at TIMESTAMPTZ NOT NULL
            )"
            .to_string(),
        },
        Migration {
            revision: "0008_fanout_execution_log",
            sql: "CREATE TABLE IF NOT EXISTS shared.fanout_execution_log (
                id BIGSERIAL PRIMARY KEY,
                request_id UUID NOT NULL,
                subrequest_id TEXT NOT NULL,
                butler TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail JSONB,
                at TIMESTAMPTZ NOT NULL
            )"
            .to_string(),
        },
        Migration {
            revision: "0009_connector_registry",
            sql: "CREATE TABLE IF NOT EXISTS shared.connector_registry (
                connector_type TEXT NOT NULL,
                endpoint_identity TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                state TEXT NOT NULL,
                counters JSONB NOT NULL DEFAULT '{}'::jsonb,
                checkpoint JSONB,
                first_seen_at TIMESTAMPTZ NOT NULL,
                last_seen_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (connector_type, endpoint_identity)
            )"
            .to_string(),
        },
        Migration {
            revision: "0010_connector_heartbeat_log",
            sql: "CREATE TABLE IF NOT EXISTS shared.connector_heartbeat_log (
                id BIGSERIAL PRIMARY KEY,
                connector_type TEXT NOT NULL,
                endpoint_identity TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                state TEXT NOT NULL,
                counters JSONB NOT NULL DEFAULT '{}'::jsonb,
                sent_at TIMESTAMPTZ NOT NULL,
                received_at TIMESTAMPTZ NOT NULL
            )"
            .to_string(),
        },
        Migration {
            revision: "0011_connector_stats_hourly",
            sql: "CREATE TABLE IF NOT EXISTS shared.connector_stats_hourly (
                connector_type TEXT NOT NULL,
                endpoint_identity TEXT NOT NULL,
                hour TIMESTAMPTZ NOT NULL,
                counters JSONB NOT NULL DEFAULT '{}'::jsonb,
                heartbeats INT NOT NULL DEFAULT 0,
                PRIMARY KEY (connector_type, endpoint_identity, hour)
            )"
            .to_string(),
        },
        Migration {
            revision: "0012_backfill_jobs",
            sql: "CREATE TABLE IF NOT EXISTS shared.backfill_jobs (
                id BIGSERIAL PRIMARY KEY,
                connector_type TEXT NOT NULL,
                endpoint_identity TEXT NOT NULL,
                range_start TIMESTAMPTZ NOT NULL,
                range_end TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
            .to_string(),
        },
    ]
}

/// A butler chain: per-butler tables in the butler's own schema.
#[must_use]
pub fn butler_chain(schema: &str) -> Vec<Migration> {
    vec![
        Migration {
            revision: "0001_schema",
            sql: format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        },
        Migration {
            revision: "0002_state",
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {schema}.state (
                    key TEXT PRIMARY KEY,
                    value JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
        },
        Migration {
            revision: "0003_sessions",
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {schema}.sessions (
                    session_id UUID PRIMARY KEY,
                    butler_name TEXT NOT NULL,
                    trigger_source TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    model TEXT,
                    status TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    completed_at TIMESTAMPTZ,
                    duration_ms BIGINT,
                    tool_calls JSONB NOT NULL DEFAULT '[]'::jsonb,
                    input_tokens BIGINT,
                    output_tokens BIGINT,
                    trace_id TEXT,
                    error TEXT,
                    parent_session_id UUID
                );
                CREATE INDEX IF NOT EXISTS sessions_created_at
                    ON {schema}.sessions (created_at DESC)"
            ),
        },
        Migration {
            revision: "0004_trigger_log",
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {schema}.trigger_log (
                    id BIGSERIAL PRIMARY KEY,
                    butler_name TEXT NOT NULL,
                    trigger_source TEXT NOT NULL,
                    session_id UUID,
                    outcome TEXT NOT NULL,
                    at TIMESTAMPTZ NOT NULL
                )"
            ),
        },
        Migration {
            revision: "0005_scheduled_tasks",
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {schema}.scheduled_tasks (
                    name TEXT PRIMARY KEY,
                    cron TEXT NOT NULL,
                    dispatch_mode TEXT NOT NULL DEFAULT 'prompt',
                    enabled BOOLEAN NOT NULL DEFAULT TRUE,
                    prompt TEXT,
                    job_name TEXT,
                    job_args JSONB,
                    last_run_at TIMESTAMPTZ,
                    next_run_at TIMESTAMPTZ
                )"
            ),
        },
        Migration {
            revision: "0006_pending_actions",
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {schema}.pending_actions (
                    action_id UUID PRIMARY KEY,
                    butler TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    tool_args JSONB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    risk_tier TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    decided_at TIMESTAMPTZ,
                    expires_at TIMESTAMPTZ,
                    execution_result JSONB
                )"
            ),
        },
        Migration {
            revision: "0007_approval_events",
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {schema}.approval_events (
                    id BIGSERIAL PRIMARY KEY,
                    action_id UUID NOT NULL,
                    kind TEXT NOT NULL,
                    detail JSONB,
                    at TIMESTAMPTZ NOT NULL
                );
                CREATE OR REPLACE FUNCTION {schema}.approval_events_immutable()
                RETURNS trigger AS $$
                BEGIN
                    RAISE EXCEPTION 'approval_events is append-only';
                END;
                $$ LANGUAGE plpgsql;
                DROP TRIGGER IF EXISTS approval_events_no_rewrite
                    ON {schema}.approval_events;
                CREATE TRIGGER approval_events_no_rewrite
                    BEFORE UPDATE OR DELETE ON {schema}.approval_events
                    FOR EACH ROW EXECUTE FUNCTION {schema}.approval_events_immutable()"
            ),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_chain_revisions_are_unique_and_ordered() {
        let chain = core_chain();
        let mut seen = std::collections::HashSet::new();
        for migration in &chain {
            assert!(seen.insert(migration.revision), "duplicate {}", migration.revision);
        }
        let revisions: Vec<_> = chain.iter().map(|m| m.revision).collect();
        let mut sorted = revisions.clone();
        sorted.sort_unstable();
        assert_eq!(revisions, sorted);
    }

    #[test]
    fn test_butler_chain_is_schema_scoped() {
        let chain = butler_chain("health");
        assert!(chain.iter().all(|m| m.sql.contains("health")));
        assert!(chain.iter().any(|m| m.sql.contains("pending_actions")));
        assert!(chain.iter().any(|m| m.sql.contains("approval_events")));
    }

    #[test]
    fn test_approval_events_chain_installs_append_only_trigger() {
        let chain = butler_chain("health");
        let events = chain
            .iter()
            .find(|m| m.revision == "0007_approval_events")
            .unwrap();
        assert!(events.sql.contains("BEFORE UPDATE OR DELETE"));
    }
}
