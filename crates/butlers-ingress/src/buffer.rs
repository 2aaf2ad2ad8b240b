//! The bounded in-memory priority queue.
//!
//! Three tiers; higher tiers drain first, FIFO within a tier. One
//! producer (the ingest API, plus the scanner), many consumers (workers).
//! `try_push` refuses when full: the durable table is the overflow, never
//! this queue.

use butlers_core::envelope::PolicyTier;
use butlers_core::{IngressId, RequestId};
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferItem {
    /// Durable queue row id.
    pub ingress_id: IngressId,
    /// Inbox record to process.
    pub request_id: RequestId,
    /// Priority tier.
    pub tier: PolicyTier,
}

#[derive(Debug, Default)]
struct Tiers {
    high: VecDeque<BufferItem>,
    interactive: VecDeque<BufferItem>,
    default: VecDeque<BufferItem>,
}

impl Tiers {
    fn len(&self) -> usize {
        self.high.len() + self.interactive.len() + self.default.len()
    }

    fn push(&mut self, item: BufferItem) {
        match item.tier {
            PolicyTier::HighPriority => self.high.push_back(item),
            PolicyTier::Interactive => self.interactive.push_back(item),
            PolicyTier::Default => self.default.push_back(item),
        }
    }

    fn pop(&mut self) -> Option<BufferItem> {
        self.high
            .pop_front()
            .or_else(|| self.interactive.pop_front())
            .or_else(|| self.default.pop_front())
    }
}

/// Bounded three-tier queue.
#[derive(Debug)]
pub struct IngressBuffer {
    tiers: Mutex<Tiers>,
    capacity: usize,
    ready: Notify,
}

impl IngressBuffer {
    /// Create a buffer with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: Mutex::new(Tiers::default()),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Enqueue if there is room. Returns `false` when full (the caller
    /// leaves the item to the durable table).
    pub async fn try_push(&self, item: BufferItem) -> bool {
        let mut tiers = self.tiers.lock().await;
        if tiers.len() >= self.capacity {
            return false;
        }
        tiers.push(item);
        drop(tiers);
        self.ready.notify_one();
        true
    }

    /// Take the highest-priority item, waiting until one arrives.
    pub async fn pop(&self) -> BufferItem {
        loop {
            // Arm the notification before checking so a push between the
            // check and the await cannot be lost.
            let notified = self.ready.notified();
            if let Some(item) = self.tiers.lock().await.pop() {
                // Wake another consumer in case more items remain.
                self.ready.notify_one();
                return item;
            }
            notified.await;
        }
    }

    /// Take an item if one is queued.
    pub async fn try_pop(&self) -> Option<BufferItem> {
        self.tiers.lock().await.pop()
    }

    /// Items currently queued.
    pub async fn len(&self) -> usize {
        self.tiers.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(tier: PolicyTier) -> BufferItem {
        BufferItem {
            ingress_id: IngressId::new(),
            request_id: RequestId::new(),
            tier,
        }
    }

    #[tokio::test]
    async fn test_priority_order() {
        let buffer = IngressBuffer::new(16);
        assert!(buffer.try_push(item(PolicyTier::Default)).await);
        assert!(buffer.try_push(item(PolicyTier::HighPriority)).await);
        assert!(buffer.try_push(item(PolicyTier::Interactive)).await);
        assert!(buffer.try_push(item(PolicyTier::HighPriority)).await);

        let order: Vec<PolicyTier> = [
            buffer.pop().await,
            buffer.pop().await,
            buffer.pop().await,
            buffer.pop().await,
        ]
        .iter()
        .map(|i| i.tier)
        .collect();
        assert_eq!(
            order,
            vec![
                PolicyTier::HighPriority,
                PolicyTier::HighPriority,
                PolicyTier::Interactive,
                PolicyTier::Default
            ]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_tier() {
        let buffer = IngressBuffer::new(16);
        let first = item(PolicyTier::Default);
        let second = item(PolicyTier::Default);
        buffer.try_push(first.clone()).await;
        buffer.try_push(second.clone()).await;
        assert_eq!(buffer.pop().await, first);
        assert_eq!(buffer.pop().await, second);
    }

    #[tokio::test]
    async fn test_capacity_refuses_overflow() {
        let buffer = IngressBuffer::new(2);
        assert!(buffer.try_push(item(PolicyTier::Default)).await);
        assert!(buffer.try_push(item(PolicyTier::Default)).await);
        assert!(!buffer.try_push(item(PolicyTier::HighPriority)).await);
        assert_eq!(buffer.len().await, 2);
        // Draining frees a slot.
        buffer.pop().await;
        assert!(buffer.try_push(item(PolicyTier::HighPriority)).await);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let buffer = Arc::new(IngressBuffer::new(4));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::task::yield_now().await;
        let pushed = item(PolicyTier::Interactive);
        assert!(buffer.try_push(pushed.clone()).await);
        assert_eq!(consumer.await.unwrap(), pushed);
    }
}
