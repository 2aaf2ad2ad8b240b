//! The canonical `ingest.v1` envelope and its boundary validation.
//!
//! Connectors post opaque JSON; everything is parsed into explicit structs
//! here, at the edge. Internal code never touches raw envelope JSON again.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

/// The only schema version this core accepts.
pub const INGEST_SCHEMA_VERSION: &str = "ingest.v1";

/// Width of the payload-hash dedupe bucket, in seconds.
///
/// Envelopes with no idempotency key and no external event id fall back to
/// hashing their payload; two identical payloads within the same bucket
/// collapse to one request.
pub const DEDUPE_BUCKET_SECS: i64 = 300;

/// Source channel of an ingested message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Telegram bot transport.
    Telegram,
    /// Slack app transport.
    Slack,
    /// Email (polling or push).
    Email,
    /// Direct HTTP API submission.
    Api,
    /// Another butler over the mesh.
    Mcp,
}

/// Upstream provider behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Telegram Bot API.
    Telegram,
    /// Slack Events API.
    Slack,
    /// Gmail API.
    Gmail,
    /// Generic IMAP endpoint.
    Imap,
    /// In-process / trusted internal caller.
    Internal,
}

/// The accepted channel/provider pairings.
const VALID_PAIRINGS: &[(Channel, Provider)] = &[
    (Channel::Telegram, Provider::Telegram),
    (Channel::Email, Provider::Gmail),
    (Channel::Email, Provider::Imap),
    (Channel::Slack, Provider::Slack),
    (Channel::Api, Provider::Internal),
    (Channel::Mcp, Provider::Internal),
];

/// Identity of the connector endpoint and sender for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestSource {
    /// Transport channel.
    pub channel: Channel,
    /// Upstream provider.
    pub provider: Provider,
    /// Which endpoint instance observed the message (bot id, mailbox, ...).
    pub endpoint_identity: String,
    /// Who sent the message on that endpoint.
    pub sender_identity: String,
}

/// Message payload as observed by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestPayload {
    /// MIME content type of `body`.
    pub content_type: String,
    /// Raw body; string or structured object depending on the provider.
    pub body: Value,
    /// Connector-normalized plain text, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_text: Option<String>,
    /// Provider-observed send time, RFC3339 with explicit offset.
    pub sent_at: String,
}

/// Priority tier requested by the connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    /// Background work; drained after the other tiers.
    #[default]
    Default,
    /// A user is waiting on this message.
    Interactive,
    /// Operator-flagged or time-critical traffic.
    HighPriority,
}

/// Routing control block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestControl {
    /// Requested priority tier.
    #[serde(default)]
    pub policy_tier: PolicyTier,
}

/// One `ingest.v1` envelope.
///
/// Unknown top-level fields are rejected so connector drift surfaces as a
/// `validation_error` rather than silent data loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestEnvelope {
    /// Must be the literal `"ingest.v1"`.
    pub schema_version: String,
    /// Endpoint + sender identity.
    pub source: IngestSource,
    /// The message payload.
    pub payload: IngestPayload,
    /// Connector-supplied idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Reply-thread target hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_target: Option<String>,
    /// Routing hints (fanout mode requests etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_hints: Option<Value>,
    /// Free-form connector metadata. `external_event_id` participates in
    /// dedupe when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
    /// Routing control block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<IngestControl>,
}

impl IngestEnvelope {
    /// Parse and validate one envelope from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a `validation_error`-class [`CoreError`] on any schema,
    /// pairing, or timestamp violation.
    pub fn parse(raw: &[u8]) -> CoreResult<Self> {
        let envelope: Self = serde_json::from_slice(raw)
            .map_err(|e| CoreError::InvalidEnvelope(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate an already-deserialized envelope.
    ///
    /// # Errors
    ///
    /// See [`IngestEnvelope::parse`].
    pub fn validate(&self) -> CoreResult<()> {
        if self.schema_version != INGEST_SCHEMA_VERSION {
            return Err(CoreError::UnsupportedSchemaVersion(
                self.schema_version.clone(),
            ));
        }
        if !VALID_PAIRINGS
            .iter()
            .any(|&(c, p)| c == self.source.channel && p == self.source.provider)
        {
            return Err(CoreError::UnknownChannelProvider {
                channel: format!("{:?}", self.source.channel).to_lowercase(),
                provider: format!("{:?}", self.source.provider).to_lowercase(),
            });
        }
        if self.source.endpoint_identity.trim().is_empty() {
            return Err(CoreError::InvalidEnvelope(
                "source.endpoint_identity must be non-empty".to_string(),
            ));
        }
        if self.source.sender_identity.trim().is_empty() {
            return Err(CoreError::InvalidEnvelope(
                "source.sender_identity must be non-empty".to_string(),
            ));
        }
        self.sent_at()?;
        Ok(())
    }

    /// The validated `sent_at` timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NaiveTimestamp`] unless the timestamp is
    /// RFC3339 with an explicit offset.
    pub fn sent_at(&self) -> CoreResult<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.payload.sent_at)
            .map_err(|_| CoreError::NaiveTimestamp(self.payload.sent_at.clone()))
    }

    /// Best-available message text for classification.
    #[must_use]
    pub fn text(&self) -> String {
        if let Some(text) = &self.payload.normalized_text {
            return text.clone();
        }
        match &self.payload.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// The connector-declared external event id, if any.
    #[must_use]
    pub fn external_event_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("external_event_id"))
            .and_then(Value::as_str)
    }

    /// The requested priority tier (default when no control block).
    #[must_use]
    pub fn policy_tier(&self) -> PolicyTier {
        self.control.as_ref().map_or_else(PolicyTier::default, |c| c.policy_tier)
    }
}

/// Derive the dedupe key for an envelope.
///
/// `SHA256(endpoint_identity || sender_identity || discriminator)` where the
/// discriminator is the idempotency key, else the external event id, else
/// the payload hash bucketed to [`DEDUPE_BUCKET_SECS`]-wide windows of
/// `observed_at`.
#[must_use]
pub fn dedupe_key(envelope: &IngestEnvelope, observed_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(envelope.source.endpoint_identity.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(envelope.source.sender_identity.as_bytes());
    hasher.update(b"\x1f");

    if let Some(key) = &envelope.idempotency_key {
        hasher.update(b"idem:");
        hasher.update(key.as_bytes());
    } else if let Some(event_id) = envelope.external_event_id() {
        hasher.update(b"event:");
        hasher.update(event_id.as_bytes());
    } else {
        let bucket = observed_at.timestamp().div_euclid(DEDUPE_BUCKET_SECS);
        let mut payload_hasher = Sha256::new();
        payload_hasher.update(envelope.payload.body.to_string().as_bytes());
        hasher.update(b"payload:");
        hasher.update(payload_hasher.finalize());
        hasher.update(b":");
        hasher.update(bucket.to_string().as_bytes());
    }

    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "schema_version": "ingest.v1",
            "source": {
                "channel": "telegram",
                "provider": "telegram",
                "endpoint_identity": "bot:butler_main",
                "sender_identity": "tg:12345"
            },
            "payload": {
                "content_type": "text/plain",
                "body": "log my weight 80kg",
                "sent_at": "2026-03-01T10:00:00+00:00"
            },
            "idempotency_key": "k1"
        })
    }

    fn sample() -> IngestEnvelope {
        IngestEnvelope::parse(sample_json().to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_valid_envelope() {
        let envelope = sample();
        assert_eq!(envelope.source.channel, Channel::Telegram);
        assert_eq!(envelope.text(), "log my weight 80kg");
        assert_eq!(envelope.policy_tier(), PolicyTier::Default);
    }

    #[test]
    fn test_rejects_wrong_schema_version() {
        let mut raw = sample_json();
        raw["schema_version"] = "ingest.v2".into();
        let err = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedSchemaVersion(v) if v == "ingest.v2"));
    }

    #[test]
    fn test_rejects_unknown_pairing() {
        let mut raw = sample_json();
        raw["source"]["provider"] = "gmail".into();
        let err = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CoreError::UnknownChannelProvider { .. }));
    }

    #[test]
    fn test_rejects_naive_timestamp() {
        let mut raw = sample_json();
        raw["payload"]["sent_at"] = "2026-03-01T10:00:00".into();
        let err = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CoreError::NaiveTimestamp(_)));
    }

    #[test]
    fn test_accepts_non_utc_offset() {
        let mut raw = sample_json();
        raw["payload"]["sent_at"] = "2026-03-01T18:00:00+08:00".into();
        let envelope = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.sent_at().unwrap().timestamp(), 1_772_359_200);
    }

    #[test]
    fn test_rejects_unknown_top_level_field() {
        let mut raw = sample_json();
        raw["surprise"] = "field".into();
        let err = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_policy_tier_from_control() {
        let mut raw = sample_json();
        raw["control"] = serde_json::json!({ "policy_tier": "high_priority" });
        let envelope = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.policy_tier(), PolicyTier::HighPriority);
    }

    #[test]
    fn test_dedupe_key_stable_for_same_idempotency_key() {
        let envelope = sample();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 2, 18, 30, 0).unwrap();
        // Idempotency key wins regardless of observation time.
        assert_eq!(dedupe_key(&envelope, t1), dedupe_key(&envelope, t2));
    }

    #[test]
    fn test_dedupe_key_differs_across_senders() {
        let a = sample();
        let mut raw = sample_json();
        raw["source"]["sender_identity"] = "tg:67890".into();
        let b = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_ne!(dedupe_key(&a, now), dedupe_key(&b, now));
    }

    #[test]
    fn test_payload_hash_bucket_is_five_minutes() {
        let mut raw = sample_json();
        raw.as_object_mut().unwrap().remove("idempotency_key");
        let envelope = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap();

        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let same_bucket = base + chrono::Duration::seconds(299);
        let next_bucket = base + chrono::Duration::seconds(300);
        assert_eq!(dedupe_key(&envelope, base), dedupe_key(&envelope, same_bucket));
        assert_ne!(dedupe_key(&envelope, base), dedupe_key(&envelope, next_bucket));
    }

    #[test]
    fn test_external_event_id_used_when_no_idempotency_key() {
        let mut raw = sample_json();
        raw.as_object_mut().unwrap().remove("idempotency_key");
        raw["metadata"] = serde_json::json!({ "external_event_id": "evt-9" });
        let envelope = IngestEnvelope::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.external_event_id(), Some("evt-9"));

        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 5, 10, 0, 0).unwrap();
        assert_eq!(dedupe_key(&envelope, t1), dedupe_key(&envelope, t2));
    }
}
