//! Environment sandbox for adapter subprocesses.
//!
//! The subprocess environment is built fresh: `PATH`, the core API keys,
//! the butler's declared module credentials, and the trace context. The
//! host environment never leaks through.

use butlers_storage::Secret;
use butlers_telemetry::{TRACEPARENT_ENV, TraceContext};
use std::collections::BTreeMap;

/// Builder for the scrubbed subprocess environment.
#[derive(Debug, Default)]
pub struct EnvSandbox {
    vars: BTreeMap<String, String>,
}

impl EnvSandbox {
    /// Start from an empty environment with the host's `PATH`.
    #[must_use]
    pub fn new() -> Self {
        let mut vars = BTreeMap::new();
        if let Ok(path) = std::env::var("PATH") {
            vars.insert("PATH".to_string(), path);
        }
        Self { vars }
    }

    /// Add one resolved credential.
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>, secret: &Secret) -> Self {
        self.vars.insert(name.into(), secret.expose().to_string());
        self
    }

    /// Add the W3C trace context.
    #[must_use]
    pub fn with_trace(mut self, trace: &TraceContext) -> Self {
        self.vars
            .insert(TRACEPARENT_ENV.to_string(), trace.to_traceparent());
        self
    }

    /// Add a plain variable (ports, endpoints).
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Finish into the subprocess env map.
    #[must_use]
    pub fn build(self) -> BTreeMap<String, String> {
        self.vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_env_does_not_leak() {
        let env = EnvSandbox::new().build();
        // PATH only, when present.
        assert!(env.len() <= 1);
        for (key, _) in std::env::vars() {
            if key != "PATH" {
                assert!(!env.contains_key(&key), "host var {key} leaked");
            }
        }
    }

    #[test]
    fn test_secrets_and_trace_are_injected() {
        let trace = TraceContext::new_root();
        let env = EnvSandbox::new()
            .with_secret("ANTHROPIC_API_KEY", &Secret::new("sk-test"))
            .with_trace(&trace)
            .with_var("BUTLER_MESH_PORT", "8351")
            .build();
        assert_eq!(env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-test"));
        assert_eq!(
            env.get(TRACEPARENT_ENV).map(String::as_str),
            Some(trace.to_traceparent().as_str())
        );
        assert_eq!(env.get("BUTLER_MESH_PORT").map(String::as_str), Some("8351"));
    }
}
