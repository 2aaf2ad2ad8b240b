//! The cold-path scanner.
//!
//! Every `interval` the scanner surfaces durable rows older than the
//! grace period whose lease is absent or expired and re-enqueues them
//! into the hot-path buffer. Anything accepted but never routed (a crash
//! mid-pipeline, a backpressured submit, a failed worker) comes back
//! through here. No permanent orphans.

use butlers_storage::QueueStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferItem, IngressBuffer};

/// Run the scanner until cancelled.
pub async fn run_scanner(
    interval: Duration,
    grace: Duration,
    batch_size: i64,
    queue: Arc<dyn QueueStore>,
    buffer: Arc<IngressBuffer>,
    cancel: CancellationToken,
) {
    info!(interval_s = interval.as_secs(), grace_s = grace.as_secs(), "ingress scanner started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("ingress scanner stopping");
                return;
            },
            _ = ticker.tick() => {},
        }

        let now = Utc::now();
        let grace_cutoff = now - ChronoDuration::seconds(i64::try_from(grace.as_secs()).unwrap_or(0));
        let stale = match queue.stale(grace_cutoff, now, batch_size).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "scanner query failed");
                continue;
            },
        };
        if stale.is_empty() {
            continue;
        }

        let mut requeued = 0_usize;
        for item in stale {
            let pushed = buffer
                .try_push(BufferItem {
                    ingress_id: item.ingress_id,
                    request_id: item.request_id,
                    tier: item.priority_tier,
                })
                .await;
            if pushed {
                requeued += 1;
            } else {
                // Buffer still full; the next pass retries.
                break;
            }
        }
        debug!(requeued, "scanner pass complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_core::envelope::PolicyTier;
    use butlers_core::{IngressId, RequestId};
    use butlers_storage::QueueItem;
    use butlers_storage::memory::MemoryQueueStore;

    fn old_item(minutes_ago: i64) -> QueueItem {
        QueueItem {
            ingress_id: IngressId::new(),
            request_id: RequestId::new(),
            priority_tier: PolicyTier::Default,
            enqueued_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
            leased_by: None,
            leased_until: None,
            attempts: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_requeues_stale_rows() {
        let queue = Arc::new(MemoryQueueStore::new());
        let buffer = Arc::new(IngressBuffer::new(8));
        // One row past the grace period, one fresh.
        queue.insert(old_item(10)).await.unwrap();
        queue.insert(old_item(0)).await.unwrap();

        let cancel = CancellationToken::new();
        let scanner = tokio::spawn(run_scanner(
            Duration::from_secs(30),
            Duration::from_secs(120),
            32,
            queue.clone(),
            buffer.clone(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        scanner.await.unwrap();

        // Only the stale row was re-enqueued.
        assert_eq!(buffer.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_respects_batch_size() {
        let queue = Arc::new(MemoryQueueStore::new());
        let buffer = Arc::new(IngressBuffer::new(64));
        for _ in 0..5 {
            queue.insert(old_item(10)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let scanner = tokio::spawn(run_scanner(
            Duration::from_secs(30),
            Duration::from_secs(120),
            2,
            queue.clone(),
            buffer.clone(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(buffer.len().await, 2);

        // Drain the batch the way workers would, then the next pass picks
        // up the remaining rows.
        while let Some(item) = buffer.try_pop().await {
            queue.complete(item.ingress_id).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        scanner.await.unwrap();
        assert_eq!(buffer.len().await, 2);
        assert_eq!(queue.depth().await.unwrap(), 3);
    }
}
