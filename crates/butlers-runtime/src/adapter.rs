//! The runtime adapter seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::RuntimeResult;

/// Token usage reported by one adapter turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterUsage {
    /// Input tokens consumed.
    pub input_tokens: i64,
    /// Output tokens produced.
    pub output_tokens: i64,
}

/// Everything one adapter turn needs.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    /// The user-visible prompt.
    pub prompt: String,
    /// The system prompt (roster `AGENTS.md`, plus memory context).
    pub system_prompt: String,
    /// MCP server config JSON handed to the CLI.
    pub mcp_config: Value,
    /// The scrubbed environment for the subprocess.
    pub env: BTreeMap<String, String>,
    /// Model override, when the butler declares one.
    pub model: Option<String>,
    /// Hard deadline for the whole turn.
    pub timeout: Duration,
}

/// The structured result of one adapter turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterOutcome {
    /// The model's final text output.
    pub output_text: String,
    /// Tool calls the CLI itself reported (supplementary to the mesh's
    /// ground-truth capture).
    pub tool_calls: Vec<Value>,
    /// Token usage.
    pub usage: AdapterUsage,
}

/// A pluggable runtime that executes one turn against a model.
///
/// Implementations spawn an ephemeral CLI process; a non-zero exit code
/// MUST surface as an error, never as an in-band error string.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Human-readable adapter name (`claude-code`, `codex`, `gemini`).
    fn name(&self) -> &str;

    /// Run one turn.
    async fn invoke(&self, request: AdapterRequest) -> RuntimeResult<AdapterOutcome>;
}
