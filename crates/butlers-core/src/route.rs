//! The `route.v1` envelope wrapping one cross-butler tool invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorBody;
use crate::types::RequestId;

/// Schema version for route requests.
pub const ROUTE_SCHEMA_VERSION: &str = "route.v1";
/// Schema version for route responses.
pub const ROUTE_RESPONSE_SCHEMA_VERSION: &str = "route_response.v1";

/// Caller context attached to every routed call.
///
/// Carries the original message provenance and trace context so the target
/// butler can audit and continue the distributed trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteContext {
    /// Source channel of the originating message, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Endpoint identity of the caller.
    pub endpoint_identity: String,
    /// Sender identity behind the original message, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_identity: Option<String>,
    /// W3C trace context of the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    /// Canonical request id this call belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

/// One `route.v1` tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEnvelope {
    /// Must be the literal `"route.v1"`.
    pub schema_version: String,
    /// Tool name on the target butler.
    pub tool: String,
    /// JSON arguments for the tool.
    pub args: Value,
    /// Caller provenance.
    pub request_context: RouteContext,
}

impl RouteEnvelope {
    /// Build a route envelope with the current schema version.
    #[must_use]
    pub fn new(tool: impl Into<String>, args: Value, request_context: RouteContext) -> Self {
        Self {
            schema_version: ROUTE_SCHEMA_VERSION.to_string(),
            tool: tool.into(),
            args,
            request_context,
        }
    }
}

/// One `route_response.v1` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResponse {
    /// The literal `"route_response.v1"`.
    pub schema_version: String,
    /// Whether the tool invocation succeeded.
    pub ok: bool,
    /// Structured tool result when `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Canonical error body when not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RouteResponse {
    /// A successful response carrying a tool result.
    #[must_use]
    pub fn success(result: Value) -> Self {
        Self {
            schema_version: ROUTE_RESPONSE_SCHEMA_VERSION.to_string(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response carrying a canonical error body.
    #[must_use]
    pub fn failure(error: ErrorBody) -> Self {
        Self {
            schema_version: ROUTE_RESPONSE_SCHEMA_VERSION.to_string(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = RouteEnvelope::new(
            "remind",
            serde_json::json!({"prompt": "call Sarah"}),
            RouteContext {
                endpoint_identity: "switchboard".to_string(),
                request_id: Some(RequestId::new()),
                ..RouteContext::default()
            },
        );
        let json = serde_json::to_string(&envelope).unwrap();
        let back: RouteEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
        assert_eq!(back.schema_version, ROUTE_SCHEMA_VERSION);
    }

    #[test]
    fn test_failure_response_carries_class() {
        let resp = RouteResponse::failure(ErrorBody::new(
            ErrorClass::TargetQuarantined,
            "butler is quarantined",
        ));
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().class, ErrorClass::TargetQuarantined);
    }
}
