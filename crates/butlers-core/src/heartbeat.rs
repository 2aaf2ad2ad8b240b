//! The `connector.heartbeat.v1` envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Schema version for connector heartbeats.
pub const HEARTBEAT_SCHEMA_VERSION: &str = "connector.heartbeat.v1";

/// Default heartbeat cadence in seconds.
pub const HEARTBEAT_DEFAULT_INTERVAL_S: u64 = 120;
/// Lower clamp for the heartbeat cadence.
pub const HEARTBEAT_MIN_INTERVAL_S: u64 = 30;
/// Upper clamp for the heartbeat cadence.
pub const HEARTBEAT_MAX_INTERVAL_S: u64 = 300;

/// Connector-reported health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    /// Operating normally.
    Healthy,
    /// Operating with elevated error rates or lag.
    Degraded,
    /// Unable to make progress.
    Error,
}

/// One heartbeat from a connector process.
///
/// Counters are monotonic since process start; the registry derives deltas
/// during rollup rather than trusting the connector to difference them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorHeartbeat {
    /// The literal `"connector.heartbeat.v1"`.
    pub schema_version: String,
    /// Connector kind (e.g. `telegram`, `gmail`).
    pub connector_type: String,
    /// Which endpoint instance is reporting.
    pub endpoint_identity: String,
    /// Unique id of this connector process instance.
    pub instance_id: String,
    /// Reported health.
    pub state: ConnectorState,
    /// Monotonic counters since process start.
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// Connector resume checkpoint, when it keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,
    /// When the heartbeat was emitted.
    pub sent_at: DateTime<Utc>,
}

impl ConnectorHeartbeat {
    /// Build a healthy heartbeat with the current schema version.
    #[must_use]
    pub fn new(
        connector_type: impl Into<String>,
        endpoint_identity: impl Into<String>,
        instance_id: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: HEARTBEAT_SCHEMA_VERSION.to_string(),
            connector_type: connector_type.into(),
            endpoint_identity: endpoint_identity.into(),
            instance_id: instance_id.into(),
            state: ConnectorState::Healthy,
            counters: BTreeMap::new(),
            checkpoint: None,
            sent_at,
        }
    }
}

/// Clamp a configured heartbeat interval into the accepted range.
#[must_use]
pub fn clamp_heartbeat_interval(configured_s: u64) -> u64 {
    configured_s.clamp(HEARTBEAT_MIN_INTERVAL_S, HEARTBEAT_MAX_INTERVAL_S)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_clamping() {
        assert_eq!(clamp_heartbeat_interval(5), HEARTBEAT_MIN_INTERVAL_S);
        assert_eq!(clamp_heartbeat_interval(120), 120);
        assert_eq!(clamp_heartbeat_interval(900), HEARTBEAT_MAX_INTERVAL_S);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let mut hb = ConnectorHeartbeat::new("telegram", "bot:main", "inst-1", Utc::now());
        hb.counters.insert("messages_ingested".to_string(), 42);
        hb.state = ConnectorState::Degraded;
        let json = serde_json::to_string(&hb).unwrap();
        let back: ConnectorHeartbeat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hb);
    }
}
