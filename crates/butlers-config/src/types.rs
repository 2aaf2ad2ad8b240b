//! Configuration types.

use butlers_core::ButlerName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Which runtime adapter executes LLM turns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    /// The `claude` CLI.
    #[default]
    ClaudeCode,
    /// The `codex` CLI.
    Codex,
    /// The `gemini` CLI.
    Gemini,
}

/// How a scheduled task is dispatched when due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run an LLM turn via the spawner with a static prompt.
    #[default]
    Prompt,
    /// Run a registered native handler; no LLM invocation, no cost.
    Job,
}

/// One declared schedule for a butler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Task name, unique per butler.
    pub name: String,
    /// 5-field UTC cron expression.
    pub cron: String,
    /// Dispatch mode.
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
    /// Whether the task fires at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Static prompt for `prompt` mode.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Registered handler name for `job` mode.
    #[serde(default)]
    pub job_name: Option<String>,
    /// JSON arguments handed to the native handler.
    #[serde(default)]
    pub job_args: Option<Value>,
}

/// One approval gate declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Tool to intercept.
    pub tool: String,
    /// Risk tier string (`low`, `medium`, `high`, `critical`).
    pub risk_tier: String,
}

/// One butler declared in the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButlerConfig {
    /// Unique butler name.
    pub name: ButlerName,
    /// Local mesh listener port.
    pub port: u16,
    /// Database schema this butler exclusively owns.
    pub schema: String,
    /// One-line description shown to the classifier.
    #[serde(default)]
    pub description: String,
    /// Enabled module names, in declaration order.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Declared schedules.
    #[serde(default, rename = "schedule")]
    pub schedules: Vec<ScheduleConfig>,
    /// Callers allowed to invoke `route.execute` on this butler.
    /// Defaults to the switchboard only.
    #[serde(default)]
    pub trusted_route_callers: Vec<String>,
    /// Tools put behind the approval gate.
    #[serde(default, rename = "gate")]
    pub gated_tools: Vec<GateConfig>,
    /// Model override for this butler's sessions.
    #[serde(default)]
    pub model: Option<String>,
}

/// Daemon-wide tunables with conservative defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonTunables {
    /// In-memory ingress queue capacity.
    pub queue_capacity: usize,
    /// Ingress worker task count.
    pub worker_count: usize,
    /// Cold-path scanner cadence, seconds.
    pub scanner_interval_s: u64,
    /// Rows younger than this are left for the hot path, seconds.
    pub scanner_grace_s: u64,
    /// Max rows re-leased per scanner pass.
    pub scanner_batch_size: i64,
    /// Max callers queued on a butler's dispatch lock.
    pub max_queued: usize,
    /// In-flight session drain budget at shutdown, seconds.
    pub shutdown_timeout_s: u64,
    /// Per-adapter-invocation timeout, seconds.
    pub adapter_timeout_s: u64,
    /// Client-side timeout for one route call, seconds.
    pub route_timeout_s: u64,
    /// Route failures within the window before quarantine.
    pub quarantine_threshold: u32,
    /// Failure-counting window, seconds.
    pub quarantine_window_s: u64,
    /// Butler heartbeat cadence, seconds.
    pub heartbeat_interval_s: u64,
    /// Registry liveness TTL granted on registration, seconds.
    pub liveness_ttl_s: u64,
    /// Which runtime adapter to use.
    pub adapter: AdapterKind,
    /// Directory holding per-butler `AGENTS.md` system prompts.
    pub roster_dir: PathBuf,
}

fn default_true() -> bool {
    true
}

impl Default for DaemonTunables {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            worker_count: 4,
            scanner_interval_s: 30,
            scanner_grace_s: 120,
            scanner_batch_size: 32,
            max_queued: 8,
            shutdown_timeout_s: 30,
            adapter_timeout_s: 300,
            route_timeout_s: 120,
            quarantine_threshold: 3,
            quarantine_window_s: 600,
            heartbeat_interval_s: 60,
            liveness_ttl_s: 180,
            adapter: AdapterKind::default(),
            roster_dir: PathBuf::from("roster"),
        }
    }
}

/// The parsed roster file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterConfig {
    /// Daemon tunables.
    #[serde(default)]
    pub daemon: DaemonTunables,
    /// The butler fleet.
    #[serde(default, rename = "butler")]
    pub butlers: Vec<ButlerConfig>,
}

impl RosterConfig {
    /// Look up one butler by name.
    #[must_use]
    pub fn butler(&self, name: &ButlerName) -> Option<&ButlerConfig> {
        self.butlers.iter().find(|b| &b.name == name)
    }

    /// The switchboard butler, when declared.
    #[must_use]
    pub fn switchboard(&self) -> Option<&ButlerConfig> {
        self.butlers.iter().find(|b| b.name.as_str() == "switchboard")
    }
}

/// Connector runtime settings resolved from `CONNECTOR_*` env vars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorSettings {
    /// Endpoint identity this connector reports as.
    pub identity: String,
    /// Where the connector persists its resume checkpoint.
    pub checkpoint_path: Option<PathBuf>,
    /// Heartbeat cadence, seconds (clamped by the core).
    pub heartbeat_interval_s: u64,
    /// Upstream poll cadence, seconds.
    pub poll_interval_s: u64,
}
