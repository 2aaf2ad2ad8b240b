//! The butler registry and its eligibility state machine.
//!
//! Transitions:
//! - `active → stale` when `last_heartbeat_at + liveness_ttl_s < now`
//!   (`ttl_expired`), either by the sweep job or lazily at the route gate
//! - `stale → active` on heartbeat (`health_restored`) or re-registration
//!   (`re_registered`)
//! - `active|stale → quarantined` on repeated route failures within the
//!   window, or operator action
//! - `quarantined → active` by operator action only

use butlers_core::ButlerName;
use butlers_storage::{EligibilityState, RegistryRecord, RegistryStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{RegistryError, RegistryResult};

/// Authoritative butler registry (switchboard-owned).
pub struct ButlerRegistry {
    store: Arc<dyn RegistryStore>,
    /// Recent route failures per butler, pruned to the window.
    failures: Mutex<HashMap<ButlerName, VecDeque<DateTime<Utc>>>>,
    quarantine_threshold: u32,
    quarantine_window: Duration,
}

impl ButlerRegistry {
    /// Create a registry over a store.
    #[must_use]
    pub fn new(
        store: Arc<dyn RegistryStore>,
        quarantine_threshold: u32,
        quarantine_window_s: u64,
    ) -> Self {
        Self {
            store,
            failures: Mutex::new(HashMap::new()),
            quarantine_threshold,
            quarantine_window: Duration::seconds(i64::try_from(quarantine_window_s).unwrap_or(600)),
        }
    }

    /// Register a butler or refresh an existing registration.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn register(&self, record: RegistryRecord) -> RegistryResult<()> {
        info!(butler = %record.name, endpoint = %record.endpoint_url, "butler registration");
        self.store.upsert_registration(record).await?;
        Ok(())
    }

    /// Record a liveness heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownButler`] for unregistered names.
    pub async fn heartbeat(&self, name: &ButlerName, now: DateTime<Utc>) -> RegistryResult<()> {
        match self.store.heartbeat(name, now).await {
            Ok(()) => Ok(()),
            Err(butlers_storage::StorageError::NotFound(_)) => {
                Err(RegistryError::UnknownButler(name.clone()))
            },
            Err(e) => Err(e.into()),
        }
    }

    fn ttl_expired(record: &RegistryRecord, now: DateTime<Utc>) -> bool {
        let ttl = Duration::seconds(record.liveness_ttl_s);
        record.last_heartbeat_at + ttl < now
    }

    /// The canonical eligibility check used by the router.
    ///
    /// Quarantined and stale butlers are rejected. A butler whose TTL has
    /// lapsed but has not yet been swept is transitioned to `stale` here
    /// and rejected.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownButler`] or [`RegistryError::Ineligible`].
    pub async fn resolve_routing_target(
        &self,
        name: &ButlerName,
        now: DateTime<Utc>,
    ) -> RegistryResult<RegistryRecord> {
        let record = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| RegistryError::UnknownButler(name.clone()))?;

        match record.eligibility_state {
            EligibilityState::Quarantined | EligibilityState::Stale => {
                Err(RegistryError::Ineligible {
                    name: name.clone(),
                    state: record.eligibility_state,
                })
            },
            EligibilityState::Active if Self::ttl_expired(&record, now) => {
                self.store
                    .set_eligibility(name, EligibilityState::Stale, "ttl_expired", now)
                    .await?;
                Err(RegistryError::Ineligible {
                    name: name.clone(),
                    state: EligibilityState::Stale,
                })
            },
            EligibilityState::Active => Ok(record),
        }
    }

    /// Butlers the classifier may route to: `active` with a live TTL.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn eligible_butlers(&self, now: DateTime<Utc>) -> RegistryResult<Vec<RegistryRecord>> {
        let all = self.store.list().await?;
        Ok(all
            .into_iter()
            .filter(|r| {
                r.eligibility_state == EligibilityState::Active && !Self::ttl_expired(r, now)
            })
            .collect())
    }

    /// TTL sweep: transition every lapsed `active` butler to `stale`.
    ///
    /// Returns the names that transitioned. Registered as the
    /// `registry_sweep` native scheduler job.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn sweep(&self, now: DateTime<Utc>) -> RegistryResult<Vec<ButlerName>> {
        let mut transitioned = Vec::new();
        for record in self.store.list().await? {
            if record.eligibility_state == EligibilityState::Active
                && Self::ttl_expired(&record, now)
            {
                self.store
                    .set_eligibility(&record.name, EligibilityState::Stale, "ttl_expired", now)
                    .await?;
                warn!(butler = %record.name, "liveness TTL expired");
                transitioned.push(record.name);
            }
        }
        Ok(transitioned)
    }

    /// Record one route failure; quarantines the butler when failures
    /// within the window reach the threshold. Returns `true` when this
    /// call caused the quarantine.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn record_route_failure(
        &self,
        name: &ButlerName,
        now: DateTime<Utc>,
    ) -> RegistryResult<bool> {
        let count = {
            let mut failures = self.failures.lock().await;
            let window = failures.entry(name.clone()).or_default();
            window.push_back(now);
            let cutoff = now - self.quarantine_window;
            while window.front().is_some_and(|&t| t < cutoff) {
                window.pop_front();
            }
            u32::try_from(window.len()).unwrap_or(u32::MAX)
        };

        if count < self.quarantine_threshold {
            return Ok(false);
        }

        let record = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| RegistryError::UnknownButler(name.clone()))?;
        if record.eligibility_state == EligibilityState::Quarantined {
            return Ok(false);
        }
        warn!(butler = %name, count, "quarantining after repeated route failures");
        self.store
            .set_eligibility(name, EligibilityState::Quarantined, "repeated_route_failures", now)
            .await?;
        self.failures.lock().await.remove(name);
        Ok(true)
    }

    /// Clear the failure window after a successful route.
    pub async fn record_route_success(&self, name: &ButlerName) {
        self.failures.lock().await.remove(name);
    }

    /// Operator action: quarantine with a reason.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn operator_quarantine(
        &self,
        name: &ButlerName,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RegistryResult<()> {
        self.store
            .set_eligibility(name, EligibilityState::Quarantined, reason, now)
            .await?;
        Ok(())
    }

    /// Operator action: the only path out of quarantine.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn operator_restore(&self, name: &ButlerName, now: DateTime<Utc>) -> RegistryResult<()> {
        self.store
            .set_eligibility(name, EligibilityState::Active, "operator_restored", now)
            .await?;
        self.failures.lock().await.remove(name);
        Ok(())
    }

    /// All registry entries.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn list(&self) -> RegistryResult<Vec<RegistryRecord>> {
        Ok(self.store.list().await?)
    }
}

impl std::fmt::Debug for ButlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ButlerRegistry")
            .field("quarantine_threshold", &self.quarantine_threshold)
            .finish_non_exhaustive()
    }
}
