//! CLI-backed runtime adapters.
//!
//! All three supported CLIs follow the same shape: write the MCP config to
//! a temp file, exec the binary with a prompt and structured-output flags,
//! wait with a deadline, parse the JSON result from stdout. Flag spellings
//! and result fields differ per flavor.

use async_trait::async_trait;
use butlers_config::AdapterKind;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::adapter::{AdapterOutcome, AdapterRequest, AdapterUsage, RuntimeAdapter};
use crate::error::{RuntimeError, RuntimeResult};

/// Max stderr bytes kept on failure.
const STDERR_TAIL: usize = 4096;

/// A CLI-backed adapter.
pub struct CliAdapter {
    kind: AdapterKind,
    binary: PathBuf,
}

impl CliAdapter {
    /// Locate the CLI binary for an adapter kind.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AdapterNotFound`] when the binary is not on
    /// PATH.
    pub fn discover(kind: AdapterKind) -> RuntimeResult<Self> {
        let name = Self::binary_name(kind);
        let binary =
            which::which(name).map_err(|_| RuntimeError::AdapterNotFound(name.to_string()))?;
        Ok(Self { kind, binary })
    }

    /// Use an explicit binary path (tests, containers).
    #[must_use]
    pub const fn with_binary(kind: AdapterKind, binary: PathBuf) -> Self {
        Self { kind, binary }
    }

    const fn binary_name(kind: AdapterKind) -> &'static str {
        match kind {
            AdapterKind::ClaudeCode => "claude",
            AdapterKind::Codex => "codex",
            AdapterKind::Gemini => "gemini",
        }
    }

    fn build_args(&self, request: &AdapterRequest, mcp_config_path: &str) -> Vec<String> {
        let mut args = Vec::new();
        match self.kind {
            AdapterKind::ClaudeCode => {
                args.extend([
                    "-p".to_string(),
                    request.prompt.clone(),
                    "--output-format".to_string(),
                    "json".to_string(),
                    "--mcp-config".to_string(),
                    mcp_config_path.to_string(),
                    "--append-system-prompt".to_string(),
                    request.system_prompt.clone(),
                ]);
                if let Some(model) = &request.model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
            },
            AdapterKind::Codex => {
                args.extend([
                    "exec".to_string(),
                    "--json".to_string(),
                    "--mcp-config".to_string(),
                    mcp_config_path.to_string(),
                ]);
                if let Some(model) = &request.model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
                args.push(request.prompt.clone());
            },
            AdapterKind::Gemini => {
                args.extend([
                    "--prompt".to_string(),
                    request.prompt.clone(),
                    "--output-format".to_string(),
                    "json".to_string(),
                ]);
                if let Some(model) = &request.model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
            },
        }
        args
    }

    /// Parse the CLI's stdout into a structured outcome.
    ///
    /// Result field names vary by flavor and version; the parser accepts
    /// the common spellings and falls back to raw stdout as plain text.
    fn parse_output(stdout: &str) -> AdapterOutcome {
        let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) else {
            return AdapterOutcome {
                output_text: stdout.trim().to_string(),
                tool_calls: Vec::new(),
                usage: AdapterUsage::default(),
            };
        };

        let output_text = ["result", "output", "text", "response"]
            .iter()
            .find_map(|key| value.get(key).and_then(Value::as_str))
            .map_or_else(|| value.to_string(), ToString::to_string);

        let tool_calls = value
            .get("tool_calls")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let usage = value.get("usage").map_or_else(AdapterUsage::default, |u| AdapterUsage {
            input_tokens: u.get("input_tokens").and_then(Value::as_i64).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
        });

        AdapterOutcome {
            output_text,
            tool_calls,
            usage,
        }
    }
}

#[async_trait]
impl RuntimeAdapter for CliAdapter {
    fn name(&self) -> &str {
        Self::binary_name(self.kind)
    }

    async fn invoke(&self, request: AdapterRequest) -> RuntimeResult<AdapterOutcome> {
        // MCP config goes through a file so secrets never hit argv.
        let mut config_file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(
            &mut config_file,
            serde_json::to_string(&request.mcp_config)
                .map_err(|e| RuntimeError::OutputParse(e.to_string()))?
                .as_bytes(),
        )?;
        let config_path = config_file.path().display().to_string();

        let args = self.build_args(&request, &config_path);
        debug!(adapter = self.name(), binary = %self.binary.display(), "spawning adapter turn");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // Nothing is fed interactively; close stdin so the CLI exits.
            let _ = stdin.shutdown().await;
        }

        let timeout_s = request.timeout.as_secs();
        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(adapter = self.name(), timeout_s, "adapter turn timed out");
                return Err(RuntimeError::AdapterTimeout { timeout_s });
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(STDERR_TAIL)
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            return Err(RuntimeError::AdapterFailed {
                code: output.status.code(),
                stderr: tail,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_output(&stdout))
    }
}

impl std::fmt::Debug for CliAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliAdapter")
            .field("kind", &self.kind)
            .field("binary", &self.binary)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_output() {
        let stdout = r#"{
            "result": "Logged 80kg.",
            "usage": {"input_tokens": 1200, "output_tokens": 40},
            "tool_calls": [{"name": "state_set", "args": {"key": "weight"}}]
        }"#;
        let outcome = CliAdapter::parse_output(stdout);
        assert_eq!(outcome.output_text, "Logged 80kg.");
        assert_eq!(outcome.usage.input_tokens, 1200);
        assert_eq!(outcome.usage.output_tokens, 40);
        assert_eq!(outcome.tool_calls.len(), 1);
    }

    #[test]
    fn test_parse_plain_text_fallback() {
        let outcome = CliAdapter::parse_output("just some text\n");
        assert_eq!(outcome.output_text, "just some text");
        assert_eq!(outcome.usage, AdapterUsage::default());
    }

    #[test]
    fn test_parse_alternate_field_names() {
        let outcome = CliAdapter::parse_output(r#"{"output": "done", "usage": {}}"#);
        assert_eq!(outcome.output_text, "done");
    }

    #[test]
    fn test_args_claude_includes_mcp_config() {
        let adapter = CliAdapter::with_binary(AdapterKind::ClaudeCode, PathBuf::from("/bin/claude"));
        let request = AdapterRequest {
            prompt: "hello".to_string(),
            system_prompt: "You are the health butler.".to_string(),
            mcp_config: serde_json::json!({}),
            env: std::collections::BTreeMap::new(),
            model: Some("claude-sonnet-4".to_string()),
            timeout: std::time::Duration::from_secs(30),
        };
        let args = adapter.build_args(&request, "/tmp/mcp.json");
        assert!(args.contains(&"--mcp-config".to_string()));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"json".to_string()));
    }

    #[test]
    fn test_args_codex_uses_exec_subcommand() {
        let adapter = CliAdapter::with_binary(AdapterKind::Codex, PathBuf::from("/bin/codex"));
        let request = AdapterRequest {
            prompt: "hello".to_string(),
            system_prompt: String::new(),
            mcp_config: serde_json::json!({}),
            env: std::collections::BTreeMap::new(),
            model: None,
            timeout: std::time::Duration::from_secs(30),
        };
        let args = adapter.build_args(&request, "/tmp/mcp.json");
        assert_eq!(args[0], "exec");
        assert_eq!(args.last().unwrap(), "hello");
    }
}
