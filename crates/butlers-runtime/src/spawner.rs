//! The per-butler spawner and its serial dispatch lock.
//!
//! `trigger()` acquires the butler's lock before creating the session row,
//! so all sessions for one butler are strictly non-overlapping. The lock
//! is deliberately held across the adapter call. A nested self-invocation
//! (`trigger_source == "trigger"`) arriving while the lock is held fails
//! fast with `overload_rejected` instead of deadlocking behind itself.

use butlers_core::{ButlerName, SessionId, TriggerSource};
use butlers_storage::{
    Secret, SessionCompletion, SessionRecord, SessionStatus, SessionStore, TriggerAuditRecord,
};
use butlers_telemetry::TraceContext;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::{AdapterRequest, AdapterUsage, RuntimeAdapter};
use crate::error::{RuntimeError, RuntimeResult};
use crate::mcp_config::mesh_mcp_config;
use crate::sandbox::EnvSandbox;

/// Static configuration for one butler's spawner.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// The butler this spawner serializes.
    pub butler: ButlerName,
    /// The butler's mesh listener port (for the MCP config).
    pub port: u16,
    /// Model override for sessions.
    pub model: Option<String>,
    /// Deadline for one adapter turn.
    pub adapter_timeout: Duration,
    /// Callers allowed to wait on the lock; excess rejects.
    pub max_queued: usize,
    /// Directory holding `<butler>/AGENTS.md`.
    pub roster_dir: PathBuf,
}

/// One trigger call.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    /// The prompt for this turn.
    pub prompt: String,
    /// What caused the trigger.
    pub source: TriggerSource,
    /// Parent session for nested lineage.
    pub parent_session_id: Option<SessionId>,
    /// Trace context to continue; a fresh root is minted when absent.
    pub trace: Option<TraceContext>,
    /// Memory context appended to the system prompt.
    pub memory_context: Option<String>,
}

impl TriggerRequest {
    /// A plain trigger with just a prompt and source.
    #[must_use]
    pub fn new(prompt: impl Into<String>, source: TriggerSource) -> Self {
        Self {
            prompt: prompt.into(),
            source,
            parent_session_id: None,
            trace: None,
            memory_context: None,
        }
    }
}

/// The result of one completed turn.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    /// The session that ran.
    pub session_id: SessionId,
    /// The model's final text.
    pub output_text: String,
    /// Token usage.
    pub usage: AdapterUsage,
}

/// Serializes LLM turns for one butler.
pub struct Spawner {
    config: SpawnerConfig,
    adapter: Arc<dyn RuntimeAdapter>,
    sessions: Arc<dyn SessionStore>,
    /// Credentials resolved at startup (core keys + module credentials).
    secrets: Vec<(String, Secret)>,
    /// The serial dispatch lock.
    lock: Mutex<()>,
    /// Callers currently waiting on the lock.
    queued: AtomicUsize,
}

impl Spawner {
    /// Create a spawner.
    #[must_use]
    pub fn new(
        config: SpawnerConfig,
        adapter: Arc<dyn RuntimeAdapter>,
        sessions: Arc<dyn SessionStore>,
        secrets: Vec<(String, Secret)>,
    ) -> Self {
        Self {
            config,
            adapter,
            sessions,
            secrets,
            lock: Mutex::new(()),
            queued: AtomicUsize::new(0),
        }
    }

    /// The session store this spawner writes to.
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    async fn audit(&self, source: TriggerSource, session_id: Option<SessionId>, outcome: &str) {
        let record = TriggerAuditRecord {
            butler_name: self.config.butler.clone(),
            trigger_source: source,
            session_id,
            outcome: outcome.to_string(),
            at: Utc::now(),
        };
        if let Err(e) = self.sessions.record_trigger(record).await {
            warn!(butler = %self.config.butler, error = %e, "trigger audit write failed");
        }
    }

    async fn system_prompt(&self, memory_context: Option<&str>) -> String {
        let path = self
            .config
            .roster_dir
            .join(self.config.butler.as_str())
            .join("AGENTS.md");
        let mut prompt = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(butler = %self.config.butler, path = %path.display(), error = %e,
                    "system prompt unreadable; using empty prompt");
                String::new()
            },
        };
        if let Some(context) = memory_context {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(context);
        }
        prompt
    }

    fn build_env(&self, trace: &TraceContext) -> BTreeMap<String, String> {
        let mut sandbox = EnvSandbox::new().with_trace(trace);
        for (name, secret) in &self.secrets {
            sandbox = sandbox.with_secret(name.clone(), secret);
        }
        sandbox.build()
    }

    /// Run one turn, serialized against every other turn for this butler.
    ///
    /// # Errors
    ///
    /// `overload_rejected` when the lock is held against a nested trigger
    /// or the wait queue is full; adapter and storage failures otherwise.
    /// Adapter failures still terminate the session row (`status=error`)
    /// and always release the lock.
    pub async fn trigger(&self, request: TriggerRequest) -> RuntimeResult<TriggerOutcome> {
        let _guard = match request.source {
            // A nested self-invocation must not wait behind its own
            // session: that is a deadlock, not a queue.
            TriggerSource::Trigger => match self.lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.audit(request.source, None, "overload_rejected").await;
                    return Err(RuntimeError::OverloadRejected {
                        butler: self.config.butler.clone(),
                        reason: "dispatch lock held by the active session".to_string(),
                    });
                },
            },
            _ => {
                let waiting = self.queued.fetch_add(1, Ordering::SeqCst);
                if waiting >= self.config.max_queued {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.audit(request.source, None, "overload_rejected").await;
                    return Err(RuntimeError::OverloadRejected {
                        butler: self.config.butler.clone(),
                        reason: format!("{waiting} callers already queued"),
                    });
                }
                let guard = self.lock.lock().await;
                self.queued.fetch_sub(1, Ordering::SeqCst);
                guard
            },
        };

        // Wall clock starts before the insert so an early insert failure
        // cannot double-count the turn.
        let timer = Instant::now();
        let session_id = SessionId::new();
        let trace = request.trace.clone().unwrap_or_else(TraceContext::new_root);

        let record = SessionRecord {
            session_id,
            butler_name: self.config.butler.clone(),
            trigger_source: request.source,
            prompt: request.prompt.clone(),
            model: self.config.model.clone(),
            status: SessionStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            tool_calls: Vec::new(),
            input_tokens: None,
            output_tokens: None,
            trace_id: Some(trace.trace_id.clone()),
            error: None,
            parent_session_id: request.parent_session_id,
        };
        self.sessions.insert_running(record).await?;
        self.audit(request.source, Some(session_id), "dispatched").await;

        let adapter_request = AdapterRequest {
            prompt: request.prompt,
            system_prompt: self.system_prompt(request.memory_context.as_deref()).await,
            mcp_config: mesh_mcp_config(&self.config.butler, self.config.port, session_id),
            env: self.build_env(&trace),
            model: self.config.model.clone(),
            timeout: self.config.adapter_timeout,
        };

        let result = self.adapter.invoke(adapter_request).await;
        let duration_ms = i64::try_from(timer.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(outcome) => {
                self.sessions
                    .complete(
                        session_id,
                        SessionCompletion {
                            status: SessionStatus::Completed,
                            completed_at: Utc::now(),
                            duration_ms,
                            tool_calls: outcome.tool_calls.clone(),
                            input_tokens: Some(outcome.usage.input_tokens),
                            output_tokens: Some(outcome.usage.output_tokens),
                            error: None,
                        },
                    )
                    .await?;
                info!(butler = %self.config.butler, %session_id, duration_ms, "session completed");
                Ok(TriggerOutcome {
                    session_id,
                    output_text: outcome.output_text,
                    usage: outcome.usage,
                })
            },
            Err(error) => {
                let completion = SessionCompletion {
                    status: SessionStatus::Error,
                    completed_at: Utc::now(),
                    duration_ms,
                    tool_calls: Vec::new(),
                    input_tokens: None,
                    output_tokens: None,
                    error: Some(error.to_string()),
                };
                if let Err(e) = self.sessions.complete(session_id, completion).await {
                    warn!(butler = %self.config.butler, %session_id, error = %e,
                        "failed to record session error");
                }
                warn!(butler = %self.config.butler, %session_id, error = %error, "session failed");
                Err(error)
            },
        }
    }

    /// Append a ground-truth tool call captured by the mesh middleware.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn record_tool_call(&self, session_id: SessionId, call: Value) -> RuntimeResult<()> {
        self.sessions.append_tool_call(session_id, call).await?;
        Ok(())
    }

    /// Wait for the in-flight session (if any) to finish.
    ///
    /// Used at shutdown: acquiring the dispatch lock means no session is
    /// running. Returns `false` when the deadline passed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.lock.lock()).await.is_ok()
    }
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner")
            .field("butler", &self.config.butler)
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;
    use butlers_storage::memory::MemorySessionStore;

    fn config() -> SpawnerConfig {
        SpawnerConfig {
            butler: "health".into(),
            port: 8351,
            model: Some("claude-sonnet-4".to_string()),
            adapter_timeout: Duration::from_secs(60),
            max_queued: 8,
            roster_dir: PathBuf::from("/nonexistent-roster"),
        }
    }

    fn spawner_with(adapter: MockAdapter) -> (Arc<Spawner>, Arc<MemorySessionStore>) {
        let sessions = Arc::new(MemorySessionStore::new());
        let spawner = Arc::new(Spawner::new(
            config(),
            Arc::new(adapter),
            sessions.clone(),
            vec![("ANTHROPIC_API_KEY".to_string(), Secret::new("sk-test"))],
        ));
        (spawner, sessions)
    }

    #[tokio::test]
    async fn test_successful_turn_writes_one_completed_session() {
        let (spawner, sessions) = spawner_with(MockAdapter::ok("done"));
        let outcome = spawner
            .trigger(TriggerRequest::new("log weight 80kg", TriggerSource::External))
            .await
            .unwrap();

        assert_eq!(outcome.output_text, "done");
        let rows = sessions.list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.status, SessionStatus::Completed);
        assert!(row.duration_ms.unwrap() >= 0);
        assert!(row.completed_at.is_some());
        assert_eq!(row.trigger_source, TriggerSource::External);
    }

    #[tokio::test]
    async fn test_adapter_failure_ends_session_with_error_and_releases_lock() {
        let (spawner, sessions) = spawner_with(MockAdapter::failing("boom"));
        let err = spawner
            .trigger(TriggerRequest::new("p", TriggerSource::External))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AdapterFailed { .. }));

        let rows = sessions.list_recent(10).await.unwrap();
        assert_eq!(rows[0].status, SessionStatus::Error);
        assert!(rows[0].error.as_deref().unwrap().contains("boom"));

        // Lock released: the next trigger is admitted (and fails the same way).
        assert!(
            spawner
                .trigger(TriggerRequest::new("p2", TriggerSource::External))
                .await
                .is_err()
        );
        assert_eq!(sessions.list_recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_serialize() {
        let (spawner, sessions) =
            spawner_with(MockAdapter::ok("ok").with_delay(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for i in 0..5 {
            let spawner = Arc::clone(&spawner);
            handles.push(tokio::spawn(async move {
                spawner
                    .trigger(TriggerRequest::new(format!("p{i}"), TriggerSource::External))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut rows = sessions.list_recent(10).await.unwrap();
        assert_eq!(rows.len(), 5);
        rows.sort_by_key(|r| r.created_at);
        // Strictly non-overlapping: each session completes before the next
        // one is created.
        for pair in rows.windows(2) {
            assert!(pair[0].completed_at.unwrap() <= pair[1].created_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_trigger_fails_fast_while_lock_held() {
        let (spawner, sessions) =
            spawner_with(MockAdapter::ok("slow").with_delay(Duration::from_secs(5)));

        let background = {
            let spawner = Arc::clone(&spawner);
            tokio::spawn(async move {
                spawner.trigger(TriggerRequest::new("outer", TriggerSource::External)).await
            })
        };
        // Let the outer turn take the lock and start its adapter call.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = spawner
            .trigger(TriggerRequest::new("inner", TriggerSource::Trigger))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::OverloadRejected { .. }));

        background.await.unwrap().unwrap();

        // The rejection was audited without a session row.
        let triggers = sessions.triggers().await;
        assert!(
            triggers
                .iter()
                .any(|t| t.outcome == "overload_rejected" && t.session_id.is_none())
        );
        assert_eq!(sessions.list_recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_cap_rejects_excess_callers() {
        let sessions = Arc::new(MemorySessionStore::new());
        let spawner = Arc::new(Spawner::new(
            SpawnerConfig {
                max_queued: 1,
                ..config()
            },
            Arc::new(MockAdapter::ok("ok").with_delay(Duration::from_secs(5))),
            sessions.clone(),
            Vec::new(),
        ));

        let first = {
            let spawner = Arc::clone(&spawner);
            tokio::spawn(async move {
                spawner.trigger(TriggerRequest::new("a", TriggerSource::External)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let spawner = Arc::clone(&spawner);
            tokio::spawn(async move {
                spawner.trigger(TriggerRequest::new("b", TriggerSource::External)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // First holds the lock, second is queued; the third exceeds the cap.
        let err = spawner
            .trigger(TriggerRequest::new("c", TriggerSource::External))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::OverloadRejected { .. }));

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_system_prompt_appends_memory_context() {
        let dir = tempfile::tempdir().unwrap();
        let butler_dir = dir.path().join("health");
        std::fs::create_dir_all(&butler_dir).unwrap();
        std::fs::write(butler_dir.join("AGENTS.md"), "You are the health butler.").unwrap();

        let sessions = Arc::new(MemorySessionStore::new());
        let spawner = Spawner::new(
            SpawnerConfig {
                roster_dir: dir.path().to_path_buf(),
                ..config()
            },
            Arc::new(MockAdapter::ok("ok")),
            sessions,
            Vec::new(),
        );

        let prompt = spawner.system_prompt(Some("Recent facts: ran 5k.")).await;
        assert_eq!(prompt, "You are the health butler.\n\nRecent facts: ran 5k.");

        let bare = spawner.system_prompt(None).await;
        assert_eq!(bare, "You are the health butler.");
    }
}
