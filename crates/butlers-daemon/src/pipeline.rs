//! The switchboard's ingest pipeline: classify → plan → dispatch.

use async_trait::async_trait;
use butlers_core::route::RouteContext;
use butlers_core::TriggerSource;
use butlers_ingress::{IngressProcessor, ProcessOutcome};
use butlers_routing::{Classifier, ClassifierInvoker, Dispatcher, FanoutPlan};
use butlers_runtime::{Spawner, TriggerRequest};
use butlers_scheduler::PromptDispatcher;
use butlers_storage::{InboxRecord, InboxStatus, InboxStore};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Classification turns run on the switchboard's own spawner.
pub(crate) struct SpawnerClassifierInvoker {
    pub(crate) spawner: Arc<Spawner>,
}

#[async_trait]
impl ClassifierInvoker for SpawnerClassifierInvoker {
    async fn invoke(&self, prompt: String) -> Result<String, String> {
        self.spawner
            .trigger(TriggerRequest::new(prompt, TriggerSource::External))
            .await
            .map(|outcome| outcome.output_text)
            .map_err(|e| e.to_string())
    }
}

/// Prompt-mode scheduled tasks run through the butler's spawner.
pub(crate) struct SpawnerPromptDispatcher {
    pub(crate) spawner: Arc<Spawner>,
}

#[async_trait]
impl PromptDispatcher for SpawnerPromptDispatcher {
    async fn dispatch_prompt(&self, prompt: &str) -> Result<(), String> {
        self.spawner
            .trigger(TriggerRequest::new(prompt, TriggerSource::Schedule))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Drives one inbox record through the full pipeline.
pub(crate) struct SwitchboardPipeline {
    pub(crate) classifier: Arc<Classifier>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) inbox: Arc<dyn InboxStore>,
}

impl SwitchboardPipeline {
    fn entries_json(entries: &[butlers_routing::ClassificationEntry]) -> Value {
        Value::Array(
            entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "butler": e.butler.as_str(),
                        "prompt": e.prompt,
                        "segment": e.segment,
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl IngressProcessor for SwitchboardPipeline {
    async fn process(&self, record: InboxRecord) -> ProcessOutcome {
        let request_id = record.new.request_id;
        let now = Utc::now();

        if self
            .inbox
            .set_status(request_id, InboxStatus::Classifying)
            .await
            .is_err()
        {
            return ProcessOutcome::Retry;
        }

        let entries = self.classifier.classify(&record.new.normalized_text, now).await;
        if self
            .inbox
            .set_classification(request_id, Self::entries_json(&entries))
            .await
            .is_err()
        {
            return ProcessOutcome::Retry;
        }

        let hints = record.new.payload.get("routing_hints");
        let plan = match FanoutPlan::build(&entries, hints) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(%request_id, error = %e, "fanout plan construction failed");
                let results = serde_json::json!({
                    "status": "failed",
                    "error": e.to_string(),
                });
                let _ = self
                    .inbox
                    .set_routing_results(request_id, results, InboxStatus::Failed)
                    .await;
                return ProcessOutcome::Terminal;
            },
        };

        if self.inbox.set_status(request_id, InboxStatus::Routing).await.is_err() {
            return ProcessOutcome::Retry;
        }

        let context = RouteContext {
            channel: Some(record.new.channel.clone()),
            endpoint_identity: "switchboard".to_string(),
            sender_identity: Some(record.new.sender_identity.clone()),
            traceparent: None,
            request_id: Some(request_id),
        };

        // The dispatcher writes routing_results and the terminal status
        // itself; only storage faults bounce the record back for retry.
        match self.dispatcher.execute(request_id, &plan, &context).await {
            Ok(_) => ProcessOutcome::Terminal,
            Err(e) => {
                warn!(%request_id, error = %e, "dispatch failed; record will be retried");
                ProcessOutcome::Retry
            },
        }
    }
}
