//! Tool registry, approval gating, and the core tool set.

use async_trait::async_trait;
use butlers_approval::{ApprovalsEngine, GateOutcome};
use butlers_core::route::RouteContext;
use butlers_core::{ButlerName, ErrorClass, SessionId, TriggerSource};
use butlers_routing::{NotifyExecutor, RouteCallGate, RouteFailure, egress_tool_allowed};
use butlers_runtime::{Spawner, TriggerRequest};
use butlers_scheduler::Scheduler;
use butlers_storage::{RiskTier, SessionStore, StateStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-invocation context handed to every tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The caller's provenance.
    pub caller: RouteContext,
    /// The session this call belongs to, when bound by the mesh
    /// middleware (ground-truth tool-call capture).
    pub session_id: Option<SessionId>,
}

/// One invocable tool.
#[async_trait]
pub trait ButlerTool: Send + Sync {
    /// Tool name.
    fn name(&self) -> &str;

    /// Invoke the tool.
    async fn invoke(&self, args: Value, context: &ToolContext) -> Result<Value, RouteFailure>;
}

/// The tools registered on one butler.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ButlerTool>>,
    /// `(this butler, the messenger)` when the egress-ownership policy is
    /// active; channel send/reply tools then only land on the messenger.
    egress_policy: Option<(ButlerName, ButlerName)>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate the egress-ownership policy for this butler.
    #[must_use]
    pub fn with_egress_policy(mut self, butler: ButlerName, messenger: ButlerName) -> Self {
        self.egress_policy = Some((butler, messenger));
        self
    }

    /// Register a tool. With the egress policy active, channel send/reply
    /// tools are stripped from every butler except the messenger.
    pub fn register(&mut self, tool: Arc<dyn ButlerTool>) {
        if let Some((butler, messenger)) = &self.egress_policy
            && !egress_tool_allowed(butler, messenger, tool.name())
        {
            info!(butler = %butler, tool = tool.name(),
                "egress tool stripped from non-messenger butler");
            return;
        }
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Wrap a registered tool behind an approval gate.
    ///
    /// Unknown names are ignored with a warning (a module may have failed
    /// to load the tool the config gates).
    pub fn apply_gate(&mut self, name: &str, engine: Arc<ApprovalsEngine>, tier: RiskTier) {
        match self.tools.remove(name) {
            Some(inner) => {
                self.tools.insert(
                    name.to_string(),
                    Arc::new(GatedTool {
                        inner,
                        engine,
                        tier,
                    }),
                );
            },
            None => warn!(tool = name, "approval gate configured for unregistered tool"),
        }
    }

    /// Invoke a tool by name.
    ///
    /// # Errors
    ///
    /// Unknown names yield `validation_error` with an "unknown tool"
    /// message (which the router's trigger fallback keys on).
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        context: &ToolContext,
    ) -> Result<Value, RouteFailure> {
        let Some(tool) = self.tools.get(name) else {
            return Err(RouteFailure::new(
                ErrorClass::ValidationError,
                format!("unknown tool '{name}'"),
            ));
        };
        tool.invoke(args, context).await
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}

/// The approval-gate wrapper.
struct GatedTool {
    inner: Arc<dyn ButlerTool>,
    engine: Arc<ApprovalsEngine>,
    tier: RiskTier,
}

#[async_trait]
impl ButlerTool for GatedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, args: Value, context: &ToolContext) -> Result<Value, RouteFailure> {
        let outcome = self
            .engine
            .intercept(self.inner.name(), args, self.tier, Utc::now())
            .await
            .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))?;

        match outcome {
            GateOutcome::AutoApproved { action_id, .. } => {
                let inner = Arc::clone(&self.inner);
                let context = context.clone();
                self.engine
                    .execute_approved_action(
                        action_id,
                        move |record| async move {
                            inner
                                .invoke(record.tool_args, &context)
                                .await
                                .map_err(|f| f.to_string())
                        },
                        Utc::now(),
                    )
                    .await
                    .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))
            },
            GateOutcome::Pending { action_id } => Ok(serde_json::json!({
                "status": "approval_pending",
                "action_id": action_id.to_string(),
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Core tools
// ---------------------------------------------------------------------------

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, RouteFailure> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| {
        RouteFailure::new(
            ErrorClass::ValidationError,
            format!("missing required argument '{key}'"),
        )
    })
}

fn runtime_failure(error: &butlers_runtime::RuntimeError) -> RouteFailure {
    RouteFailure::new(error.class(), error.to_string())
}

/// `status`: liveness and identity.
pub(crate) struct StatusTool {
    pub(crate) butler: ButlerName,
    pub(crate) started_at: DateTime<Utc>,
}

#[async_trait]
impl ButlerTool for StatusTool {
    fn name(&self) -> &str {
        "status"
    }

    async fn invoke(&self, _args: Value, _context: &ToolContext) -> Result<Value, RouteFailure> {
        Ok(serde_json::json!({
            "butler": self.butler.as_str(),
            "status": "ok",
            "uptime_s": Utc::now().signed_duration_since(self.started_at).num_seconds(),
        }))
    }
}

/// `trigger`: run one LLM turn. A call arriving from inside a running
/// session is a nested self-invocation and fails fast when the lock is
/// held.
pub(crate) struct TriggerTool {
    pub(crate) spawner: Arc<Spawner>,
}

#[async_trait]
impl ButlerTool for TriggerTool {
    fn name(&self) -> &str {
        "trigger"
    }

    async fn invoke(&self, args: Value, context: &ToolContext) -> Result<Value, RouteFailure> {
        let prompt = required_str(&args, "prompt")?;
        let source = if context.session_id.is_some() {
            TriggerSource::Trigger
        } else if args.get("source").and_then(Value::as_str) == Some("test") {
            TriggerSource::Test
        } else {
            TriggerSource::Route
        };
        let mut request = TriggerRequest::new(prompt, source);
        request.parent_session_id = context.session_id;
        let outcome = self.spawner.trigger(request).await.map_err(|e| runtime_failure(&e))?;
        Ok(serde_json::json!({
            "session_id": outcome.session_id.to_string(),
            "output": outcome.output_text,
        }))
    }
}

/// `route.execute`: the fanout entry point on every butler. Guarded by
/// the trusted-caller gate.
pub(crate) struct RouteExecuteTool {
    pub(crate) gate: RouteCallGate,
    pub(crate) spawner: Arc<Spawner>,
}

#[async_trait]
impl ButlerTool for RouteExecuteTool {
    fn name(&self) -> &str {
        "route.execute"
    }

    async fn invoke(&self, args: Value, context: &ToolContext) -> Result<Value, RouteFailure> {
        self.gate.check(&context.caller)?;
        let prompt = required_str(&args, "prompt")?;
        let outcome = self
            .spawner
            .trigger(TriggerRequest::new(prompt, TriggerSource::Route))
            .await
            .map_err(|e| runtime_failure(&e))?;
        Ok(serde_json::json!({
            "session_id": outcome.session_id.to_string(),
            "output": outcome.output_text,
        }))
    }
}

/// `tick`: fire the scheduler once (external stimulation).
pub(crate) struct TickTool {
    pub(crate) scheduler: Arc<Scheduler>,
}

#[async_trait]
impl ButlerTool for TickTool {
    fn name(&self) -> &str {
        "tick"
    }

    async fn invoke(&self, _args: Value, _context: &ToolContext) -> Result<Value, RouteFailure> {
        let report = self
            .scheduler
            .tick(Utc::now())
            .await
            .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))?;
        serde_json::to_value(report)
            .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))
    }
}

/// `notify`: channel egress through the messenger.
pub(crate) struct NotifyTool {
    pub(crate) notify: Arc<NotifyExecutor>,
}

#[async_trait]
impl ButlerTool for NotifyTool {
    fn name(&self) -> &str {
        "notify"
    }

    async fn invoke(&self, args: Value, context: &ToolContext) -> Result<Value, RouteFailure> {
        let channel = required_str(&args, "channel")?;
        let message = required_str(&args, "message")?;
        let thread_target = args.get("thread_target").and_then(Value::as_str);
        let response = self
            .notify
            .notify(channel, thread_target, message, context.caller.clone())
            .await;
        serde_json::to_value(response)
            .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))
    }
}

/// `remind`: a prompt-mode convenience over `trigger`.
pub(crate) struct RemindTool {
    pub(crate) spawner: Arc<Spawner>,
}

#[async_trait]
impl ButlerTool for RemindTool {
    fn name(&self) -> &str {
        "remind"
    }

    async fn invoke(&self, args: Value, _context: &ToolContext) -> Result<Value, RouteFailure> {
        let message = required_str(&args, "message")?;
        let outcome = self
            .spawner
            .trigger(TriggerRequest::new(
                format!("Set up this reminder and confirm it: {message}"),
                TriggerSource::Route,
            ))
            .await
            .map_err(|e| runtime_failure(&e))?;
        Ok(serde_json::json!({ "session_id": outcome.session_id.to_string() }))
    }
}

/// `state.get` / `state.set` / `state.delete`: the butler's KV store.
pub(crate) struct StateTool {
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) operation: StateOp,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum StateOp {
    Get,
    Set,
    Delete,
}

#[async_trait]
impl ButlerTool for StateTool {
    fn name(&self) -> &str {
        match self.operation {
            StateOp::Get => "state.get",
            StateOp::Set => "state.set",
            StateOp::Delete => "state.delete",
        }
    }

    async fn invoke(&self, args: Value, _context: &ToolContext) -> Result<Value, RouteFailure> {
        let key = required_str(&args, "key")?;
        let internal = |e: butlers_storage::StorageError| {
            RouteFailure::new(ErrorClass::InternalError, e.to_string())
        };
        match self.operation {
            StateOp::Get => {
                let value = self.state.get(key).await.map_err(internal)?;
                Ok(serde_json::json!({ "key": key, "value": value }))
            },
            StateOp::Set => {
                let value = args
                    .get("value")
                    .cloned()
                    .ok_or_else(|| {
                        RouteFailure::new(ErrorClass::ValidationError, "missing required argument 'value'")
                    })?;
                self.state.set(key, value).await.map_err(internal)?;
                Ok(serde_json::json!({ "key": key, "stored": true }))
            },
            StateOp::Delete => {
                let existed = self.state.delete(key).await.map_err(internal)?;
                Ok(serde_json::json!({ "key": key, "deleted": existed }))
            },
        }
    }
}

/// `schedule.list` / `schedule.enable`: the scheduler's ops surface.
pub(crate) struct ScheduleTool {
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) listing: bool,
}

#[async_trait]
impl ButlerTool for ScheduleTool {
    fn name(&self) -> &str {
        if self.listing { "schedule.list" } else { "schedule.enable" }
    }

    async fn invoke(&self, args: Value, _context: &ToolContext) -> Result<Value, RouteFailure> {
        let internal = |e: butlers_scheduler::SchedulerError| {
            RouteFailure::new(ErrorClass::InternalError, e.to_string())
        };
        if self.listing {
            let tasks = self.scheduler.tasks().await.map_err(internal)?;
            serde_json::to_value(tasks)
                .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))
        } else {
            let name = required_str(&args, "name")?;
            let enabled = args.get("enabled").and_then(Value::as_bool).unwrap_or(true);
            self.scheduler.set_enabled(name, enabled).await.map_err(internal)?;
            Ok(serde_json::json!({ "name": name, "enabled": enabled }))
        }
    }
}

/// `session.list`: recent sessions for this butler.
pub(crate) struct SessionListTool {
    pub(crate) sessions: Arc<dyn SessionStore>,
}

#[async_trait]
impl ButlerTool for SessionListTool {
    fn name(&self) -> &str {
        "session.list"
    }

    async fn invoke(&self, args: Value, _context: &ToolContext) -> Result<Value, RouteFailure> {
        let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(20);
        let sessions = self
            .sessions
            .list_recent(limit)
            .await
            .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))?;
        serde_json::to_value(sessions)
            .map_err(|e| RouteFailure::new(ErrorClass::InternalError, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_storage::memory::{MemoryActionStore, MemorySessionStore, MemoryStateStore};
    use butlers_runtime::testing::MockAdapter;
    use butlers_runtime::SpawnerConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    fn spawner() -> Arc<Spawner> {
        Arc::new(Spawner::new(
            SpawnerConfig {
                butler: "health".into(),
                port: 8351,
                model: None,
                adapter_timeout: Duration::from_secs(30),
                max_queued: 4,
                roster_dir: PathBuf::from("/nonexistent"),
            },
            Arc::new(MockAdapter::ok("done")),
            Arc::new(MemorySessionStore::new()),
            Vec::new(),
        ))
    }

    fn engine() -> Arc<ApprovalsEngine> {
        Arc::new(ApprovalsEngine::new(
            "health".into(),
            Arc::new(MemoryActionStore::new()),
            3600,
        ))
    }

    #[tokio::test]
    async fn test_unknown_tool_message_feeds_router_fallback() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke("missing", serde_json::json!({}), &ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::ValidationError);
        assert!(err.message.contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_route_execute_rejects_untrusted_caller() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(RouteExecuteTool {
            gate: RouteCallGate::new(&[]),
            spawner: spawner(),
        }));

        let mut context = ToolContext::default();
        context.caller.endpoint_identity = "stranger".to_string();
        let err = registry
            .invoke("route.execute", serde_json::json!({"prompt": "p"}), &context)
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::ValidationError);

        context.caller.endpoint_identity = "switchboard".to_string();
        let result = registry
            .invoke("route.execute", serde_json::json!({"prompt": "p"}), &context)
            .await
            .unwrap();
        assert_eq!(result["output"], "done");
    }

    #[tokio::test]
    async fn test_gated_tool_parks_then_executes_on_rule() {
        let engine = engine();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StateTool {
            state: Arc::new(MemoryStateStore::new()),
            operation: StateOp::Set,
        }));
        registry.apply_gate("state.set", Arc::clone(&engine), RiskTier::Medium);

        // No rule: the call parks.
        let result = registry
            .invoke(
                "state.set",
                serde_json::json!({"key": "k", "value": 1}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "approval_pending");

        // With a blanket medium-tier rule the call runs straight through.
        engine
            .add_rule(
                butlers_approval::StandingRule {
                    rule_id: butlers_approval::RuleId::new(),
                    tool_name: "state.set".to_string(),
                    constraints: vec![],
                    expires_at: None,
                    max_uses: None,
                    uses: 0,
                    created_at: Utc::now(),
                },
                RiskTier::Medium,
            )
            .await
            .unwrap();
        let result = registry
            .invoke(
                "state.set",
                serde_json::json!({"key": "k", "value": 1}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(result["stored"], true);
    }

    #[tokio::test]
    async fn test_trigger_from_session_is_nested() {
        let spawner = spawner();
        let tool = TriggerTool {
            spawner: Arc::clone(&spawner),
        };

        // Without a bound session this is a route-source trigger.
        let result = tool
            .invoke(serde_json::json!({"prompt": "p"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(result["session_id"].is_string());

        // With a bound session the source is `trigger` (and, with the lock
        // free, it still succeeds).
        let context = ToolContext {
            session_id: Some(SessionId::new()),
            ..ToolContext::default()
        };
        let result = tool.invoke(serde_json::json!({"prompt": "p"}), &context).await.unwrap();
        assert!(result["session_id"].is_string());
        let sessions = spawner.sessions().list_recent(10).await.unwrap();
        assert_eq!(sessions[0].trigger_source, TriggerSource::Trigger);
        assert_eq!(sessions[1].trigger_source, TriggerSource::Route);
    }

    #[tokio::test]
    async fn test_egress_filter_on_module_tools() {
        struct SendTool;
        #[async_trait]
        impl ButlerTool for SendTool {
            fn name(&self) -> &str {
                "send_telegram"
            }
            async fn invoke(&self, _a: Value, _c: &ToolContext) -> Result<Value, RouteFailure> {
                Ok(Value::Null)
            }
        }

        let messenger: ButlerName = "messenger".into();
        let mut on_health =
            ToolRegistry::new().with_egress_policy("health".into(), messenger.clone());
        on_health.register(Arc::new(SendTool));
        assert!(on_health.names().is_empty());

        let mut on_messenger =
            ToolRegistry::new().with_egress_policy(messenger.clone(), messenger);
        on_messenger.register(Arc::new(SendTool));
        assert_eq!(on_messenger.names(), vec!["send_telegram".to_string()]);
    }
}
