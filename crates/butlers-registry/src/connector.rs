//! Connector heartbeat intake and stats aggregation.

use butlers_core::heartbeat::HEARTBEAT_SCHEMA_VERSION;
use butlers_core::ConnectorHeartbeat;
use butlers_storage::{ConnectorRecord, ConnectorStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};

/// Connector-facing side of the registry.
pub struct ConnectorMonitor {
    store: Arc<dyn ConnectorStore>,
}

impl ConnectorMonitor {
    /// Create a monitor over a store.
    #[must_use]
    pub fn new(store: Arc<dyn ConnectorStore>) -> Self {
        Self { store }
    }

    /// Accept one heartbeat.
    ///
    /// Unknown `(connector_type, endpoint_identity)` pairs auto-create a
    /// registry row with `first_seen_at` set; subsequent heartbeats update
    /// in place. Returns `true` when the row was created.
    ///
    /// # Errors
    ///
    /// Rejects envelopes with the wrong schema version or empty identity.
    pub async fn ingest_heartbeat(
        &self,
        heartbeat: &ConnectorHeartbeat,
        now: DateTime<Utc>,
    ) -> RegistryResult<bool> {
        if heartbeat.schema_version != HEARTBEAT_SCHEMA_VERSION {
            return Err(RegistryError::InvalidHeartbeat(format!(
                "unsupported schema version {}",
                heartbeat.schema_version
            )));
        }
        if heartbeat.endpoint_identity.trim().is_empty() {
            return Err(RegistryError::InvalidHeartbeat(
                "endpoint_identity must be non-empty".to_string(),
            ));
        }

        let created = self.store.record_heartbeat(heartbeat, now).await?;
        if created {
            info!(
                connector = %heartbeat.connector_type,
                endpoint = %heartbeat.endpoint_identity,
                "connector auto-registered on first heartbeat"
            );
        } else {
            debug!(
                connector = %heartbeat.connector_type,
                endpoint = %heartbeat.endpoint_identity,
                state = ?heartbeat.state,
                "connector heartbeat"
            );
        }
        Ok(created)
    }

    /// Fetch one connector row.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn get(
        &self,
        connector_type: &str,
        endpoint_identity: &str,
    ) -> RegistryResult<Option<ConnectorRecord>> {
        Ok(self.store.get(connector_type, endpoint_identity).await?)
    }

    /// All connector rows.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn list(&self) -> RegistryResult<Vec<ConnectorRecord>> {
        Ok(self.store.list().await?)
    }

    /// Fold heartbeat-log rows older than one hour into hourly stats.
    /// Registered as the `connector_stats_rollup` native scheduler job.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn rollup(&self, now: DateTime<Utc>) -> RegistryResult<u64> {
        let cutoff = now - Duration::hours(1);
        let folded = self.store.rollup(cutoff).await?;
        if folded > 0 {
            info!(folded, "connector heartbeat rollup");
        }
        Ok(folded)
    }
}

impl std::fmt::Debug for ConnectorMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorMonitor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_storage::memory::MemoryConnectorStore;

    #[tokio::test]
    async fn test_first_heartbeat_auto_creates() {
        let store = Arc::new(MemoryConnectorStore::new());
        let monitor = ConnectorMonitor::new(store.clone());
        let now = Utc::now();
        let hb = ConnectorHeartbeat::new("telegram", "bot:main", "inst-1", now);

        assert!(monitor.ingest_heartbeat(&hb, now).await.unwrap());
        let record = monitor.get("telegram", "bot:main").await.unwrap().unwrap();
        assert_eq!(record.first_seen_at, now);

        // Subsequent heartbeat updates rather than duplicating.
        let later = now + Duration::seconds(120);
        assert!(!monitor.ingest_heartbeat(&hb, later).await.unwrap());
        let record = monitor.get("telegram", "bot:main").await.unwrap().unwrap();
        assert_eq!(record.first_seen_at, now);
        assert_eq!(record.last_seen_at, later);
        assert_eq!(monitor.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_schema_version() {
        let monitor = ConnectorMonitor::new(Arc::new(MemoryConnectorStore::new()));
        let mut hb = ConnectorHeartbeat::new("telegram", "bot:main", "inst-1", Utc::now());
        hb.schema_version = "connector.heartbeat.v2".to_string();
        let err = monitor.ingest_heartbeat(&hb, Utc::now()).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidHeartbeat(_)));
    }

    #[tokio::test]
    async fn test_rollup_folds_old_rows() {
        let store = Arc::new(MemoryConnectorStore::new());
        let monitor = ConnectorMonitor::new(store.clone());
        let old = Utc::now() - Duration::hours(3);
        let hb = ConnectorHeartbeat::new("telegram", "bot:main", "inst-1", old);
        monitor.ingest_heartbeat(&hb, old).await.unwrap();

        let folded = monitor.rollup(Utc::now()).await.unwrap();
        assert_eq!(folded, 1);
        assert_eq!(store.stats_rows().await, 1);
        // Second rollup finds nothing.
        assert_eq!(monitor.rollup(Utc::now()).await.unwrap(), 0);
    }
}
