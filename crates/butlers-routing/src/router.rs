//! Cross-butler routing with a cached mesh client per endpoint.

use async_trait::async_trait;
use butlers_core::route::{RouteContext, RouteEnvelope, RouteResponse};
use butlers_core::{ButlerName, ErrorClass, RetryConfig};
use butlers_registry::{ButlerRegistry, RegistryError};
use butlers_storage::{EligibilityState, RoutingLogRecord, RoutingLogStore};
use butlers_telemetry::TraceContext;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dispatcher::SubrequestRunner;
use crate::error::RouteFailure;
use crate::plan::Subrequest;

/// One live connection to a butler's mesh endpoint.
#[async_trait]
pub trait MeshClient: Send + Sync {
    /// Lightweight health probe; `false` means the connection is dead.
    async fn probe(&self) -> bool;

    /// Invoke a tool through the `route.v1` envelope.
    async fn call_tool(&self, envelope: RouteEnvelope) -> Result<RouteResponse, RouteFailure>;
}

/// Creates mesh clients for endpoint URLs.
#[async_trait]
pub trait MeshConnector: Send + Sync {
    /// Open a connection.
    async fn connect(&self, endpoint_url: &str) -> Result<Arc<dyn MeshClient>, RouteFailure>;
}

/// Routes tool invocations to eligible butlers.
pub struct Router {
    registry: Arc<ButlerRegistry>,
    connector: Arc<dyn MeshConnector>,
    /// Cached clients keyed by endpoint URL.
    clients: DashMap<String, Arc<dyn MeshClient>>,
    log: Arc<dyn RoutingLogStore>,
    call_timeout: Duration,
}

impl Router {
    /// Create a router.
    #[must_use]
    pub fn new(
        registry: Arc<ButlerRegistry>,
        connector: Arc<dyn MeshConnector>,
        log: Arc<dyn RoutingLogStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connector,
            clients: DashMap::new(),
            log,
            call_timeout,
        }
    }

    fn map_registry_error(error: &RegistryError) -> RouteFailure {
        match error {
            RegistryError::UnknownButler(name) => {
                RouteFailure::new(ErrorClass::ValidationError, format!("unknown butler {name}"))
            },
            RegistryError::Ineligible { name, state } => match state {
                EligibilityState::Quarantined => RouteFailure::new(
                    ErrorClass::TargetQuarantined,
                    format!("butler {name} is quarantined"),
                ),
                _ => RouteFailure::new(
                    ErrorClass::TargetUnavailable,
                    format!("butler {name} is stale"),
                ),
            },
            other => RouteFailure::new(ErrorClass::InternalError, other.to_string()),
        }
    }

    /// Fetch-or-create the cached client for an endpoint, probing cached
    /// entries before reuse.
    async fn client_for(&self, endpoint_url: &str) -> Result<Arc<dyn MeshClient>, RouteFailure> {
        if let Some(cached) = self.clients.get(endpoint_url).map(|entry| Arc::clone(entry.value())) {
            if cached.probe().await {
                return Ok(cached);
            }
            debug!(endpoint = endpoint_url, "cached client failed probe; reconnecting");
            self.clients.remove(endpoint_url);
        }
        let client = self.connector.connect(endpoint_url).await?;
        self.clients
            .insert(endpoint_url.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn call_with_timeout(
        &self,
        client: &Arc<dyn MeshClient>,
        envelope: RouteEnvelope,
    ) -> Result<RouteResponse, RouteFailure> {
        match tokio::time::timeout(self.call_timeout, client.call_tool(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(RouteFailure::new(
                ErrorClass::Timeout,
                format!("route call exceeded {}s", self.call_timeout.as_secs()),
            )),
        }
    }

    fn unknown_tool(failure: &RouteFailure) -> bool {
        failure.class == ErrorClass::ValidationError
            && failure.message.to_lowercase().contains("unknown tool")
    }

    /// Map the original args onto the generic `trigger` tool.
    fn trigger_fallback_args(args: &Value) -> Value {
        let prompt = args
            .get("prompt")
            .or_else(|| args.get("message"))
            .and_then(Value::as_str)
            .map_or_else(|| args.to_string(), ToString::to_string);
        serde_json::json!({ "prompt": prompt })
    }

    /// Invoke a named tool on a named butler.
    ///
    /// Resolves the target through the registry gate, reuses (or heals)
    /// the cached client, injects trace context, and retries an
    /// "unknown tool" rejection once against the target's generic
    /// `trigger` tool.
    ///
    /// # Errors
    ///
    /// A classified [`RouteFailure`]; `target_unavailable` failures also
    /// feed the registry's quarantine window.
    pub async fn route(
        &self,
        target: &ButlerName,
        tool: &str,
        args: Value,
        mut context: RouteContext,
    ) -> Result<Value, RouteFailure> {
        let started = Instant::now();
        let now = Utc::now();

        let record = self
            .registry
            .resolve_routing_target(target, now)
            .await
            .map_err(|e| Self::map_registry_error(&e))?;

        // Every hop gets a fresh span on the caller's trace.
        let trace = context
            .traceparent
            .as_deref()
            .and_then(|t| TraceContext::parse(t).ok())
            .map_or_else(TraceContext::new_root, |t| t.child());
        context.traceparent = Some(trace.to_traceparent());

        let result = self
            .route_inner(&record.endpoint_url, tool, args, &context)
            .await;

        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(failure) => failure.class.to_string(),
        };
        let log_record = RoutingLogRecord {
            request_id: context.request_id,
            target: target.clone(),
            tool: tool.to_string(),
            outcome,
            duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            at: Utc::now(),
        };
        if let Err(e) = self.log.record_route(log_record).await {
            warn!(error = %e, "routing log write failed");
        }

        match &result {
            Ok(_) => self.registry.record_route_success(target).await,
            Err(failure) if failure.class == ErrorClass::TargetUnavailable => {
                match self.registry.record_route_failure(target, Utc::now()).await {
                    Ok(true) => info!(butler = %target, "target quarantined after repeated failures"),
                    Ok(false) => {},
                    Err(e) => warn!(error = %e, "failure tracking error"),
                }
            },
            Err(_) => {},
        }

        result
    }

    async fn route_inner(
        &self,
        endpoint_url: &str,
        tool: &str,
        args: Value,
        context: &RouteContext,
    ) -> Result<Value, RouteFailure> {
        let client = self.client_for(endpoint_url).await?;
        let envelope = RouteEnvelope::new(tool, args.clone(), context.clone());

        let response = self.call_with_timeout(&client, envelope).await?;
        if response.ok {
            return Ok(response.result.unwrap_or(Value::Null));
        }

        let failure: RouteFailure = response
            .error
            .map_or_else(
                || RouteFailure::new(ErrorClass::InternalError, "target reported failure without detail"),
                Into::into,
            );

        if Self::unknown_tool(&failure) && tool != "trigger" {
            debug!(endpoint = endpoint_url, tool, "unknown tool; retrying via trigger");
            let fallback = RouteEnvelope::new(
                "trigger",
                Self::trigger_fallback_args(&args),
                context.clone(),
            );
            let response = self.call_with_timeout(&client, fallback).await?;
            if response.ok {
                return Ok(response.result.unwrap_or(Value::Null));
            }
            return Err(response.error.map_or_else(
                || RouteFailure::new(ErrorClass::InternalError, "trigger fallback failed"),
                Into::into,
            ));
        }

        Err(failure)
    }
}

#[async_trait]
impl SubrequestRunner for Router {
    async fn run(
        &self,
        subrequest: &Subrequest,
        context: &RouteContext,
    ) -> Result<Value, RouteFailure> {
        // `target_unavailable` is the one transient class worth a retry
        // from the dispatcher's standpoint; everything else is terminal
        // for the subrequest.
        let retry_config = RetryConfig {
            max_attempts: 2,
            ..RetryConfig::default()
        };
        butlers_core::retry(
            &retry_config,
            |failure: &RouteFailure| failure.class == ErrorClass::TargetUnavailable,
            || {
                self.route(
                    &subrequest.butler,
                    "route.execute",
                    serde_json::json!({
                        "prompt": subrequest.prompt,
                        "segment_id": subrequest.segment_id,
                    }),
                    context.clone(),
                )
            },
        )
        .await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("cached_clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_core::ErrorBody;
    use butlers_storage::memory::{MemoryRegistryStore, MemoryRoutingLogStore};
    use butlers_storage::RegistryRecord;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// A scripted endpoint.
    struct ScriptedClient {
        alive: AtomicBool,
        calls: Mutex<Vec<RouteEnvelope>>,
        respond: fn(&RouteEnvelope) -> Result<RouteResponse, RouteFailure>,
    }

    #[async_trait]
    impl MeshClient for ScriptedClient {
        async fn probe(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn call_tool(&self, envelope: RouteEnvelope) -> Result<RouteResponse, RouteFailure> {
            let respond = self.respond;
            self.calls.lock().await.push(envelope.clone());
            respond(&envelope)
        }
    }

    struct ScriptedConnector {
        client: Arc<ScriptedClient>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl MeshConnector for ScriptedConnector {
        async fn connect(&self, _endpoint_url: &str) -> Result<Arc<dyn MeshClient>, RouteFailure> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.client) as Arc<dyn MeshClient>)
        }
    }

    async fn registry_with_butler(name: &str) -> Arc<ButlerRegistry> {
        let registry = Arc::new(ButlerRegistry::new(Arc::new(MemoryRegistryStore::new()), 3, 600));
        let now = Utc::now();
        registry
            .register(RegistryRecord {
                name: name.into(),
                endpoint_url: format!("http://127.0.0.1:9000/{name}"),
                route_contract_min: 1,
                route_contract_max: 1,
                capabilities: vec![],
                description: String::new(),
                eligibility_state: EligibilityState::Active,
                last_heartbeat_at: now,
                liveness_ttl_s: 180,
                quarantine_reason: None,
                first_seen_at: now,
            })
            .await
            .unwrap();
        registry
    }

    fn ok_response(_: &RouteEnvelope) -> Result<RouteResponse, RouteFailure> {
        Ok(RouteResponse::success(serde_json::json!({"done": true})))
    }

    fn scripted(
        respond: fn(&RouteEnvelope) -> Result<RouteResponse, RouteFailure>,
    ) -> (Arc<ScriptedClient>, Arc<ScriptedConnector>) {
        let client = Arc::new(ScriptedClient {
            alive: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            respond,
        });
        let connector = Arc::new(ScriptedConnector {
            client: Arc::clone(&client),
            connects: AtomicUsize::new(0),
        });
        (client, connector)
    }

    fn router(registry: Arc<ButlerRegistry>, connector: Arc<ScriptedConnector>) -> Router {
        Router::new(
            registry,
            connector,
            Arc::new(MemoryRoutingLogStore::new()),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_route_success_and_trace_injection() {
        let registry = registry_with_butler("health").await;
        let (client, connector) = scripted(ok_response);
        let router = router(registry, connector);

        let result = router
            .route(&"health".into(), "remind", serde_json::json!({}), RouteContext::default())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"done": true}));

        let calls = client.calls.lock().await;
        assert_eq!(calls.len(), 1);
        // Trace context was injected.
        let traceparent = calls[0].request_context.traceparent.as_deref().unwrap();
        assert!(TraceContext::parse(traceparent).is_ok());
    }

    #[tokio::test]
    async fn test_client_cache_reused_until_probe_fails() {
        let registry = registry_with_butler("health").await;
        let (client, connector) = scripted(ok_response);
        let router = router(registry, connector.clone());
        let name: ButlerName = "health".into();

        router.route(&name, "t", serde_json::json!({}), RouteContext::default()).await.unwrap();
        router.route(&name, "t", serde_json::json!({}), RouteContext::default()).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // Kill the connection; next call reconnects.
        client.alive.store(false, Ordering::SeqCst);
        router.route(&name, "t", serde_json::json!({}), RouteContext::default()).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_retries_via_trigger() {
        fn respond(envelope: &RouteEnvelope) -> Result<RouteResponse, RouteFailure> {
            if envelope.tool == "trigger" {
                Ok(RouteResponse::success(serde_json::json!("triggered")))
            } else {
                Ok(RouteResponse::failure(ErrorBody::new(
                    ErrorClass::ValidationError,
                    "unknown tool 'remind'",
                )))
            }
        }
        let registry = registry_with_butler("health").await;
        let (client, connector) = scripted(respond);
        let router = router(registry, connector);

        let result = router
            .route(
                &"health".into(),
                "remind",
                serde_json::json!({"message": "call Sarah"}),
                RouteContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("triggered"));

        let calls = client.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].tool, "trigger");
        // The prompt argument was mapped through the message fallback.
        assert_eq!(calls[1].args["prompt"], "call Sarah");
    }

    #[tokio::test]
    async fn test_quarantine_after_repeated_unavailable() {
        fn respond(_: &RouteEnvelope) -> Result<RouteResponse, RouteFailure> {
            Err(RouteFailure::new(ErrorClass::TargetUnavailable, "connection refused"))
        }
        let registry = registry_with_butler("errand").await;
        let (_client, connector) = scripted(respond);
        let router = router(Arc::clone(&registry), connector);
        let name: ButlerName = "errand".into();

        for _ in 0..3 {
            let err = router
                .route(&name, "t", serde_json::json!({}), RouteContext::default())
                .await
                .unwrap_err();
            assert_eq!(err.class, ErrorClass::TargetUnavailable);
        }

        // The registry gate now rejects the target outright.
        let err = router
            .route(&name, "t", serde_json::json!({}), RouteContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::TargetQuarantined);
        // And the classifier context omits it.
        assert!(registry.eligible_butlers(Utc::now()).await.unwrap().is_empty());

        // Operator restores; routing works again... once the endpoint is back.
        registry.operator_restore(&name, Utc::now()).await.unwrap();
        let err = router
            .route(&name, "t", serde_json::json!({}), RouteContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::TargetUnavailable);
    }

    #[tokio::test]
    async fn test_unknown_butler_is_validation_error() {
        let registry = registry_with_butler("health").await;
        let (_client, connector) = scripted(ok_response);
        let router = router(registry, connector);

        let err = router
            .route(&"ghost".into(), "t", serde_json::json!({}), RouteContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::ValidationError);
    }
}
