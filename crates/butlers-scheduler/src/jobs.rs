//! Native job handlers.
//!
//! Job-mode tasks run deterministic work (rollups, sweeps, expiry) without
//! an LLM invocation. Handlers register under a name; the scheduler looks
//! them up at firing time.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One deterministic job.
#[async_trait]
pub trait NativeJob: Send + Sync {
    /// Run the job with its configured JSON args.
    ///
    /// # Errors
    ///
    /// A human-readable reason; the scheduler audit-logs it and reschedules
    /// the task for the next cycle.
    async fn run(&self, args: Value) -> Result<Value, String>;
}

/// Registered native jobs for one butler.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn NativeJob>>,
}

impl JobRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name. Later registrations replace earlier
    /// ones.
    pub fn register(&mut self, name: impl Into<String>, job: Arc<dyn NativeJob>) {
        self.handlers.insert(name.into(), job);
    }

    /// Look up a handler.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeJob>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").field("jobs", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl NativeJob for Echo {
        async fn run(&self, args: Value) -> Result<Value, String> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn test_register_and_run() {
        let mut registry = JobRegistry::new();
        registry.register("echo", Arc::new(Echo));
        let job = registry.get("echo").unwrap();
        let out = job.run(serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(out, serde_json::json!({"n": 1}));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }
}
