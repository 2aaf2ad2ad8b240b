//! Route-call authorization and channel egress.
//!
//! Every butler checks incoming `route.execute` callers against its
//! `trusted_route_callers` allow-list (default: switchboard only); an
//! unauthorized caller gets `validation_error` and nothing runs. All
//! channel egress goes out through the messenger butler, which is the
//! sole owner of send/reply tools.

use butlers_core::route::RouteContext;
use butlers_core::{ButlerName, ErrorClass};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::error::RouteFailure;
use crate::router::Router;

/// The default trusted caller when a butler declares none.
const DEFAULT_TRUSTED_CALLER: &str = "switchboard";

/// Per-butler allow-list for incoming route calls.
#[derive(Debug, Clone)]
pub struct RouteCallGate {
    trusted: HashSet<String>,
}

impl RouteCallGate {
    /// Build from the butler's declared list; empty means switchboard only.
    #[must_use]
    pub fn new(trusted_route_callers: &[String]) -> Self {
        let trusted = if trusted_route_callers.is_empty() {
            HashSet::from([DEFAULT_TRUSTED_CALLER.to_string()])
        } else {
            trusted_route_callers.iter().cloned().collect()
        };
        Self { trusted }
    }

    /// Check the caller's endpoint identity.
    ///
    /// # Errors
    ///
    /// `validation_error` with no side effects for unauthorized callers.
    pub fn check(&self, context: &RouteContext) -> Result<(), RouteFailure> {
        if self.trusted.contains(&context.endpoint_identity) {
            return Ok(());
        }
        warn!(caller = %context.endpoint_identity, "unauthorized route caller rejected");
        Err(RouteFailure::new(
            ErrorClass::ValidationError,
            format!("caller '{}' is not a trusted route caller", context.endpoint_identity),
        ))
    }
}

/// The notify response surfaced to callers and connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponse {
    /// Whether the message went out.
    pub ok: bool,
    /// Canonical error class on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Whether a retry may help.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Human-readable detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Channel egress via the messenger butler.
pub struct NotifyExecutor {
    router: Arc<Router>,
    messenger: ButlerName,
}

impl NotifyExecutor {
    /// Create an executor routing through the named messenger.
    #[must_use]
    pub fn new(router: Arc<Router>, messenger: ButlerName) -> Self {
        Self { router, messenger }
    }

    /// Send a message out through the messenger butler.
    ///
    /// Failures never panic the pipeline; the response carries the
    /// canonical class and a retryable flag.
    pub async fn notify(
        &self,
        channel: &str,
        thread_target: Option<&str>,
        message: &str,
        context: RouteContext,
    ) -> NotifyResponse {
        let args = serde_json::json!({
            "channel": channel,
            "thread_target": thread_target,
            "message": message,
        });
        match self
            .router
            .route(&self.messenger, "send_message", args, context)
            .await
        {
            Ok(_) => NotifyResponse {
                ok: true,
                error_class: None,
                retryable: None,
                detail: None,
            },
            Err(failure) => NotifyResponse {
                ok: false,
                error_class: Some(failure.class),
                retryable: Some(failure.is_retryable()),
                detail: Some(failure.message),
            },
        }
    }

    /// The target of all egress.
    #[must_use]
    pub fn messenger(&self) -> &ButlerName {
        &self.messenger
    }
}

impl std::fmt::Debug for NotifyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyExecutor")
            .field("messenger", &self.messenger)
            .finish_non_exhaustive()
    }
}

/// A tool-name filter implementing egress ownership: channel send/reply
/// tools are registered only on the messenger butler.
#[must_use]
pub fn egress_tool_allowed(butler: &ButlerName, messenger: &ButlerName, tool: &str) -> bool {
    let is_egress = tool.starts_with("send_") || tool.starts_with("reply_");
    !is_egress || butler == messenger
}
