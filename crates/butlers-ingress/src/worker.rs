//! Ingress worker tasks.
//!
//! A worker pops from the buffer, takes the durable lease, and drives the
//! record through classify→dispatch via the injected processor. Terminal
//! records drop their queue row; failures release the lease so the
//! scanner retries later.

use async_trait::async_trait;
use butlers_storage::{InboxRecord, InboxStatus, InboxStore, QueueStore};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::IngressBuffer;

/// What processing one record produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The record reached a terminal status; drop the queue row.
    Terminal,
    /// Transient failure; release the lease and let the scanner retry.
    Retry,
}

/// The classify→dispatch pipeline, injected by the daemon.
#[async_trait]
pub trait IngressProcessor: Send + Sync {
    /// Process one inbox record to (ideally) a terminal status.
    async fn process(&self, record: InboxRecord) -> ProcessOutcome;
}

/// How long a worker's lease lasts.
const LEASE_SECONDS: i64 = 300;

/// Run one worker until cancelled.
pub async fn run_worker(
    worker_id: usize,
    buffer: Arc<IngressBuffer>,
    queue: Arc<dyn QueueStore>,
    inbox: Arc<dyn InboxStore>,
    processor: Arc<dyn IngressProcessor>,
    cancel: CancellationToken,
) {
    let worker_name = format!("ingress-worker-{worker_id}");
    info!(worker = %worker_name, "ingress worker started");

    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => {
                info!(worker = %worker_name, "ingress worker stopping");
                return;
            },
            item = buffer.pop() => item,
        };

        let now = Utc::now();
        let until = now + Duration::seconds(LEASE_SECONDS);
        match queue.try_lease(item.ingress_id, &worker_name, now, until).await {
            Ok(true) => {},
            Ok(false) => {
                // Another worker (or a fresher lease) owns it.
                debug!(worker = %worker_name, request_id = %item.request_id, "lease lost; skipping");
                continue;
            },
            Err(e) => {
                warn!(worker = %worker_name, error = %e, "lease attempt failed");
                continue;
            },
        }

        let record = match inbox.get(item.request_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(worker = %worker_name, request_id = %item.request_id,
                    "queue item without inbox record; dropping");
                let _ = queue.complete(item.ingress_id).await;
                continue;
            },
            Err(e) => {
                warn!(worker = %worker_name, error = %e, "inbox fetch failed; releasing lease");
                let _ = queue.release(item.ingress_id).await;
                continue;
            },
        };

        if record.status.is_terminal() {
            debug!(worker = %worker_name, request_id = %item.request_id, "already terminal");
            let _ = queue.complete(item.ingress_id).await;
            continue;
        }

        match processor.process(record).await {
            ProcessOutcome::Terminal => {
                if let Err(e) = queue.complete(item.ingress_id).await {
                    warn!(worker = %worker_name, error = %e, "queue completion failed");
                }
            },
            ProcessOutcome::Retry => {
                // Put the record back to `accepted` and free the lease; the
                // scanner re-enqueues after the grace period.
                if let Err(e) = inbox.set_status(item.request_id, InboxStatus::Accepted).await {
                    warn!(worker = %worker_name, error = %e, "status reset failed");
                }
                if let Err(e) = queue.release(item.ingress_id).await {
                    warn!(worker = %worker_name, error = %e, "lease release failed");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::IngestApi;
    use butlers_storage::memory::{MemoryInboxStore, MemoryQueueStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MarkTerminal {
        inbox: Arc<MemoryInboxStore>,
        processed: AtomicUsize,
        retry_first: AtomicUsize,
    }

    #[async_trait]
    impl IngressProcessor for MarkTerminal {
        async fn process(&self, record: InboxRecord) -> ProcessOutcome {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if self.retry_first.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return ProcessOutcome::Retry;
            }
            self.inbox
                .set_routing_results(
                    record.new.request_id,
                    json!({"status": "completed"}),
                    InboxStatus::Completed,
                )
                .await
                .unwrap();
            ProcessOutcome::Terminal
        }
    }

    fn envelope(key: &str) -> Vec<u8> {
        json!({
            "schema_version": "ingest.v1",
            "source": {
                "channel": "api",
                "provider": "internal",
                "endpoint_identity": "test",
                "sender_identity": "tester"
            },
            "payload": {
                "content_type": "text/plain",
                "body": "hello",
                "sent_at": "2026-03-01T10:00:00+00:00"
            },
            "idempotency_key": key
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_worker_drives_record_to_terminal() {
        let inbox = Arc::new(MemoryInboxStore::new());
        let queue = Arc::new(MemoryQueueStore::new());
        let buffer = Arc::new(IngressBuffer::new(8));
        let api = IngestApi::new(inbox.clone(), queue.clone(), buffer.clone());

        let response = api.submit_raw(&envelope("k1"), Utc::now()).await.unwrap();

        let processor = Arc::new(MarkTerminal {
            inbox: inbox.clone(),
            processed: AtomicUsize::new(0),
            retry_first: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            0,
            buffer.clone(),
            queue.clone(),
            inbox.clone(),
            processor.clone(),
            cancel.clone(),
        ));

        // Wait for the queue row to disappear.
        for _ in 0..100 {
            if queue.depth().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
        let record = inbox.get(response.request_id).await.unwrap().unwrap();
        assert_eq!(record.status, InboxStatus::Completed);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_releases_lease_for_scanner() {
        let inbox = Arc::new(MemoryInboxStore::new());
        let queue = Arc::new(MemoryQueueStore::new());
        let buffer = Arc::new(IngressBuffer::new(8));
        let api = IngestApi::new(inbox.clone(), queue.clone(), buffer.clone());
        api.submit_raw(&envelope("k1"), Utc::now()).await.unwrap();

        let processor = Arc::new(MarkTerminal {
            inbox: inbox.clone(),
            processed: AtomicUsize::new(0),
            retry_first: AtomicUsize::new(1),
        });
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            0,
            buffer.clone(),
            queue.clone(),
            inbox.clone(),
            processor.clone(),
            cancel.clone(),
        ));

        for _ in 0..100 {
            if processor.processed.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        worker.await.unwrap();

        // Row survives with a released lease; the scanner will retry it.
        assert_eq!(queue.depth().await.unwrap(), 1);
        let now = Utc::now();
        let stale = queue.stale(now, now, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(stale[0].leased_by.is_none());
    }
}
