//! Newtype identifiers used throughout the orchestration pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Mint a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id! {
    /// Canonical identifier for one ingested message, minted by the core.
    RequestId
}

uuid_id! {
    /// Identifier for one LLM-CLI session.
    SessionId
}

uuid_id! {
    /// Identifier for one pending (gated) action.
    ActionId
}

uuid_id! {
    /// Identifier for one ingress buffer item.
    IngressId
}

uuid_id! {
    /// Identifier for one subrequest within a fanout plan.
    SubrequestId
}

/// A butler's unique name.
///
/// Butler names are stable string keys; registry entries and routing
/// targets reference butlers by name, never by live handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ButlerName(String);

impl ButlerName {
    /// Create a butler name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ButlerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ButlerName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ButlerName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What caused a session to be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// An externally-ingested message routed to this butler.
    External,
    /// A scheduled task in `prompt` dispatch mode.
    Schedule,
    /// A `route.execute` call from another butler.
    Route,
    /// A nested self-invocation from within a running session.
    Trigger,
    /// Operator-initiated test trigger.
    Test,
    /// Heartbeat-driven maintenance turn.
    Heartbeat,
}

impl TriggerSource {
    /// Stable string form used in session rows and audit logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Schedule => "schedule",
            Self::Route => "route",
            Self::Trigger => "trigger",
            Self::Test => "test",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_roundtrip() {
        let id = RequestId::new();
        let text = id.to_string();
        let parsed: RequestId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_butler_name_display() {
        let name = ButlerName::from("health");
        assert_eq!(name.to_string(), "health");
        assert_eq!(name.as_str(), "health");
    }

    #[test]
    fn test_trigger_source_serde() {
        let json = serde_json::to_string(&TriggerSource::Schedule).unwrap();
        assert_eq!(json, "\"schedule\"");
        let back: TriggerSource = serde_json::from_str("\"external\"").unwrap();
        assert_eq!(back, TriggerSource::External);
    }
}
