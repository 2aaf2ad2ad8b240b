//! Test doubles for the runtime seam.
//!
//! Used across the workspace's test suites; compiled unconditionally so
//! downstream crates can drive full pipelines without a real CLI.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::adapter::{AdapterOutcome, AdapterRequest, AdapterUsage, RuntimeAdapter};
use crate::error::{RuntimeError, RuntimeResult};

/// A scripted adapter: fixed outcome, optional artificial latency.
pub struct MockAdapter {
    output_text: String,
    delay: Duration,
    fail_with: Option<String>,
    invocations: AtomicUsize,
}

impl MockAdapter {
    /// An adapter that succeeds with the given text.
    #[must_use]
    pub fn ok(output_text: impl Into<String>) -> Self {
        Self {
            output_text: output_text.into(),
            delay: Duration::ZERO,
            fail_with: None,
            invocations: AtomicUsize::new(0),
        }
    }

    /// An adapter that fails every turn (non-zero exit equivalent).
    #[must_use]
    pub fn failing(stderr: impl Into<String>) -> Self {
        Self {
            output_text: String::new(),
            delay: Duration::ZERO,
            fail_with: Some(stderr.into()),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Add artificial per-turn latency.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// How many turns ran.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: AdapterRequest) -> RuntimeResult<AdapterOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(stderr) = &self.fail_with {
            return Err(RuntimeError::AdapterFailed {
                code: Some(1),
                stderr: stderr.clone(),
            });
        }
        Ok(AdapterOutcome {
            output_text: self.output_text.clone(),
            tool_calls: Vec::new(),
            usage: AdapterUsage {
                input_tokens: i64::try_from(request.prompt.len()).unwrap_or(0),
                output_tokens: i64::try_from(self.output_text.len()).unwrap_or(0),
            },
        })
    }
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("fails", &self.fail_with.is_some())
            .finish_non_exhaustive()
    }
}
