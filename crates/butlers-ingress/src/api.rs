//! The `ingest.v1` intake surface.

use butlers_core::{CoreError, IngestEnvelope, IngressId, RequestId, dedupe_key};
use butlers_storage::{InboxStore, NewInboxRecord, QueueItem, QueueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::buffer::{BufferItem, IngressBuffer};
use crate::error::IngressResult;

/// The `202 Accepted` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Canonical request id (the original's on a dedupe hit).
    pub request_id: RequestId,
    /// Whether this envelope was a duplicate.
    pub duplicate: bool,
    /// Always `"accepted"`.
    pub status: String,
}

/// The ingest API (switchboard-owned).
pub struct IngestApi {
    inbox: Arc<dyn InboxStore>,
    queue: Arc<dyn QueueStore>,
    buffer: Arc<IngressBuffer>,
}

impl IngestApi {
    /// Create the API over the shared stores and the hot-path buffer.
    #[must_use]
    pub fn new(
        inbox: Arc<dyn InboxStore>,
        queue: Arc<dyn QueueStore>,
        buffer: Arc<IngressBuffer>,
    ) -> Self {
        Self {
            inbox,
            queue,
            buffer,
        }
    }

    /// Accept one raw envelope.
    ///
    /// # Errors
    ///
    /// `validation_error` on schema violations; storage errors map to
    /// `internal_error` (the connector retries).
    pub async fn submit_raw(&self, raw: &[u8], now: DateTime<Utc>) -> IngressResult<IngestResponse> {
        let envelope = IngestEnvelope::parse(raw)?;
        self.submit(&envelope, now).await
    }

    /// Accept one validated envelope.
    ///
    /// Two envelopes with the same dedupe identity yield the same
    /// `request_id`; the second insert is a no-op and is not re-enqueued.
    ///
    /// # Errors
    ///
    /// See [`IngestApi::submit_raw`].
    pub async fn submit(
        &self,
        envelope: &IngestEnvelope,
        now: DateTime<Utc>,
    ) -> IngressResult<IngestResponse> {
        envelope.validate()?;
        let key = dedupe_key(envelope, now);
        let channel = serde_json::to_value(envelope.source.channel)
            .map_err(CoreError::from)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let provider = serde_json::to_value(envelope.source.provider)
            .map_err(CoreError::from)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let record = NewInboxRecord {
            request_id: RequestId::new(),
            dedupe_key: key,
            channel,
            provider,
            endpoint_identity: envelope.source.endpoint_identity.clone(),
            sender_identity: envelope.source.sender_identity.clone(),
            payload: serde_json::to_value(envelope).map_err(CoreError::from)?,
            normalized_text: envelope.text(),
            policy_tier: envelope.policy_tier(),
            observed_at: now,
        };

        let (request_id, duplicate) = self.inbox.upsert(record).await?;
        if duplicate {
            debug!(%request_id, "duplicate envelope; returning original request id");
            return Ok(IngestResponse {
                request_id,
                duplicate: true,
                status: "accepted".to_string(),
            });
        }

        let item = QueueItem {
            ingress_id: IngressId::new(),
            request_id,
            priority_tier: envelope.policy_tier(),
            enqueued_at: now,
            leased_by: None,
            leased_until: None,
            attempts: 0,
        };
        self.queue.insert(item.clone()).await?;

        let buffered = self
            .buffer
            .try_push(BufferItem {
                ingress_id: item.ingress_id,
                request_id,
                tier: item.priority_tier,
            })
            .await;
        if buffered {
            info!(%request_id, tier = ?item.priority_tier, "envelope accepted");
        } else {
            // Queue full: the row is durable and the scanner will pick it
            // up as workers free slots.
            info!(%request_id, "buffer full; envelope persisted for cold-path pickup");
        }

        Ok(IngestResponse {
            request_id,
            duplicate: false,
            status: "accepted".to_string(),
        })
    }
}

impl std::fmt::Debug for IngestApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestApi").finish_non_exhaustive()
    }
}
