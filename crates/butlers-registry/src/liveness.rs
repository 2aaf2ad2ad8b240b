//! Per-butler liveness reporting.
//!
//! Each non-switchboard butler runs one [`LivenessReporter`] task: register
//! on startup, then heartbeat on a fixed cadence. A missing heartbeat
//! endpoint is persistent misconfiguration, not a transient fault: the
//! reporter logs one warning and stops rather than retrying forever.

use async_trait::async_trait;
use butlers_storage::RegistryRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failures a registry client can report.
#[derive(Debug, thiserror::Error)]
pub enum RegistryClientError {
    /// The switchboard has no heartbeat endpoint (HTTP 404 equivalent).
    /// Treated as permanent; the reporter stops.
    #[error("registry endpoint not found")]
    EndpointNotFound,

    /// Transient transport failure; the reporter retries next tick.
    #[error("registry unreachable: {0}")]
    Unreachable(String),
}

/// Transport seam towards the switchboard registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Post a registration (idempotent refresh).
    async fn post_registration(&self, record: RegistryRecord) -> Result<(), RegistryClientError>;

    /// Post a liveness heartbeat.
    async fn post_heartbeat(&self, name: &str) -> Result<(), RegistryClientError>;
}

/// The liveness reporting loop for one butler.
pub struct LivenessReporter {
    client: Arc<dyn RegistryClient>,
    record: RegistryRecord,
    interval: Duration,
}

impl LivenessReporter {
    /// Create a reporter.
    #[must_use]
    pub fn new(client: Arc<dyn RegistryClient>, record: RegistryRecord, interval: Duration) -> Self {
        Self {
            client,
            record,
            interval,
        }
    }

    /// Run until cancelled or the endpoint turns out to be missing.
    pub async fn run(self, cancel: CancellationToken) {
        let name = self.record.name.clone();

        match self.client.post_registration(self.record.clone()).await {
            Ok(()) => info!(butler = %name, "registered with switchboard"),
            Err(RegistryClientError::EndpointNotFound) => {
                warn!(butler = %name, "registry endpoint missing; liveness reporter stopping");
                return;
            },
            Err(RegistryClientError::Unreachable(reason)) => {
                warn!(butler = %name, %reason, "registration failed; will retry on heartbeat cadence");
            },
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; consume it.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(butler = %name, "liveness reporter cancelled");
                    return;
                },
                _ = ticker.tick() => {},
            }

            match self.client.post_heartbeat(name.as_str()).await {
                Ok(()) => debug!(butler = %name, "heartbeat posted"),
                Err(RegistryClientError::EndpointNotFound) => {
                    // One warning, then stop. Persistent misconfiguration
                    // does not deserve a retry storm.
                    warn!(butler = %name, "heartbeat endpoint missing; liveness reporter stopping");
                    return;
                },
                Err(RegistryClientError::Unreachable(reason)) => {
                    warn!(butler = %name, %reason, "heartbeat failed; retrying next tick");
                },
            }
        }
    }
}

impl std::fmt::Debug for LivenessReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessReporter")
            .field("butler", &self.record.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_storage::EligibilityState;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingClient {
        registrations: AtomicU32,
        heartbeats: AtomicU32,
        heartbeat_result: fn(u32) -> Result<(), RegistryClientError>,
    }

    #[async_trait]
    impl RegistryClient for CountingClient {
        async fn post_registration(
            &self,
            _record: RegistryRecord,
        ) -> Result<(), RegistryClientError> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn post_heartbeat(&self, _name: &str) -> Result<(), RegistryClientError> {
            let n = self.heartbeats.fetch_add(1, Ordering::SeqCst);
            (self.heartbeat_result)(n)
        }
    }

    fn record() -> RegistryRecord {
        RegistryRecord {
            name: "health".into(),
            endpoint_url: "http://127.0.0.1:8351".to_string(),
            route_contract_min: 1,
            route_contract_max: 1,
            capabilities: vec![],
            description: String::new(),
            eligibility_state: EligibilityState::Active,
            last_heartbeat_at: Utc::now(),
            liveness_ttl_s: 180,
            quarantine_reason: None,
            first_seen_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_registers_then_heartbeats() {
        let client = Arc::new(CountingClient {
            registrations: AtomicU32::new(0),
            heartbeats: AtomicU32::new(0),
            heartbeat_result: |_| Ok(()),
        });
        let reporter =
            LivenessReporter::new(client.clone(), record(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reporter.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(185)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(client.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(client.heartbeats.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_after_endpoint_not_found() {
        let client = Arc::new(CountingClient {
            registrations: AtomicU32::new(0),
            heartbeats: AtomicU32::new(0),
            heartbeat_result: |_| Err(RegistryClientError::EndpointNotFound),
        });
        let reporter =
            LivenessReporter::new(client.clone(), record(), Duration::from_secs(60));
        let handle = tokio::spawn(reporter.run(CancellationToken::new()));

        tokio::time::sleep(Duration::from_secs(600)).await;
        // The reporter stopped after exactly one failed heartbeat.
        handle.await.unwrap();
        assert_eq!(client.heartbeats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_retries_transient_failures() {
        let client = Arc::new(CountingClient {
            registrations: AtomicU32::new(0),
            heartbeats: AtomicU32::new(0),
            heartbeat_result: |n| {
                if n == 0 {
                    Err(RegistryClientError::Unreachable("connection refused".to_string()))
                } else {
                    Ok(())
                }
            },
        });
        let reporter =
            LivenessReporter::new(client.clone(), record(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reporter.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(125)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(client.heartbeats.load(Ordering::SeqCst), 2);
    }
}
