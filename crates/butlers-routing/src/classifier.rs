//! LLM-backed message decomposition.
//!
//! The classifier runs one adapter turn on the switchboard, asking the
//! model to split the message into self-contained per-butler prompts. The
//! output contract is deliberately loose: unknown fields are ignored,
//! malformed entries are skipped, ineligible targets are dropped, and any
//! total failure falls back to a single `general` entry. Classification
//! never fails the pipeline.

use async_trait::async_trait;
use butlers_core::ButlerName;
use butlers_registry::ButlerRegistry;
use butlers_storage::RegistryRecord;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

/// The fallback target when classification yields nothing usable.
pub const FALLBACK_BUTLER: &str = "general";

/// One routing entry produced by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationEntry {
    /// Target butler.
    pub butler: ButlerName,
    /// Self-contained prompt for that butler.
    pub prompt: String,
    /// Which part of the message this entry covers (spans, offsets, or a
    /// rationale).
    pub segment: Value,
}

/// Seam through which the classifier reaches the switchboard's adapter.
#[async_trait]
pub trait ClassifierInvoker: Send + Sync {
    /// Run one classification turn, returning the raw model output.
    async fn invoke(&self, prompt: String) -> Result<String, String>;
}

/// The message classifier.
pub struct Classifier {
    registry: Arc<ButlerRegistry>,
    invoker: Arc<dyn ClassifierInvoker>,
}

impl Classifier {
    /// Create a classifier.
    #[must_use]
    pub fn new(registry: Arc<ButlerRegistry>, invoker: Arc<dyn ClassifierInvoker>) -> Self {
        Self { registry, invoker }
    }

    /// Decompose one message into routing entries. Always returns at
    /// least one entry.
    pub async fn classify(&self, text: &str, now: DateTime<Utc>) -> Vec<ClassificationEntry> {
        let eligible = match self.registry.eligible_butlers(now).await {
            Ok(butlers) => butlers,
            Err(e) => {
                warn!(error = %e, "registry unavailable; classification falls back");
                return vec![Self::fallback(text)];
            },
        };

        if eligible.is_empty() {
            warn!("no eligible butlers; classification falls back");
            return vec![Self::fallback(text)];
        }

        let prompt = Self::compose_prompt(text, &eligible);
        let output = match self.invoker.invoke(prompt).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "classifier turn failed; falling back to general");
                return vec![Self::fallback(text)];
            },
        };

        let names: HashSet<&str> = eligible.iter().map(|b| b.name.as_str()).collect();
        let entries = Self::parse_entries(&output, &names);
        if entries.is_empty() {
            warn!("classifier output unusable; falling back to general");
            return vec![Self::fallback(text)];
        }
        debug!(count = entries.len(), "message classified");
        entries
    }

    fn fallback(text: &str) -> ClassificationEntry {
        ClassificationEntry {
            butler: ButlerName::from(FALLBACK_BUTLER),
            prompt: text.to_string(),
            segment: serde_json::json!({ "rationale": "fallback" }),
        }
    }

    /// Build the classification prompt over the eligible fleet.
    fn compose_prompt(text: &str, eligible: &[RegistryRecord]) -> String {
        let mut prompt = String::from(
            "Decompose the user message into routing entries. Reply with a JSON array; \
             each element is {\"butler\": <name>, \"prompt\": <self-contained instruction>, \
             \"segment\": {\"rationale\": <why>}}. Use only these butlers:\n",
        );
        for butler in eligible {
            let _ = writeln!(prompt, "- {}: {}", butler.name, butler.description);
        }
        let _ = write!(prompt, "\nMessage:\n{text}");
        prompt
    }

    /// Tolerant parse of the model's output.
    ///
    /// Accepts a bare JSON array or an array embedded in surrounding
    /// prose. Entries must carry `butler`, `prompt`, and a `segment` with
    /// at least one of `sentence_spans`, `offsets`, or `rationale`; extra
    /// fields are ignored; bad entries are skipped; entries naming
    /// ineligible butlers are dropped with a warning.
    fn parse_entries(output: &str, eligible: &HashSet<&str>) -> Vec<ClassificationEntry> {
        let array = Self::extract_array(output);
        let Some(Value::Array(items)) = array else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        for item in items {
            let Some(butler) = item.get("butler").and_then(Value::as_str) else {
                debug!("classifier entry missing butler; skipped");
                continue;
            };
            let Some(prompt) = item.get("prompt").and_then(Value::as_str) else {
                debug!(butler, "classifier entry missing prompt; skipped");
                continue;
            };
            let Some(segment) = item.get("segment").filter(|s| Self::segment_valid(s)) else {
                debug!(butler, "classifier entry missing usable segment; skipped");
                continue;
            };
            if !eligible.contains(butler) {
                warn!(butler, "classifier named an ineligible butler; entry dropped");
                continue;
            }
            entries.push(ClassificationEntry {
                butler: ButlerName::from(butler),
                prompt: prompt.to_string(),
                segment: segment.clone(),
            });
        }
        entries
    }

    fn segment_valid(segment: &Value) -> bool {
        segment.is_object()
            && ["sentence_spans", "offsets", "rationale"]
                .iter()
                .any(|key| segment.get(key).is_some())
    }

    fn extract_array(output: &str) -> Option<Value> {
        if let Ok(value @ Value::Array(_)) = serde_json::from_str(output.trim()) {
            return Some(value);
        }
        let start = output.find('[')?;
        let end = output.rfind(']')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&output[start..=end]).ok()
    }
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_storage::memory::MemoryRegistryStore;
    use butlers_storage::EligibilityState;

    struct ScriptedInvoker {
        output: Result<String, String>,
    }

    #[async_trait]
    impl ClassifierInvoker for ScriptedInvoker {
        async fn invoke(&self, _prompt: String) -> Result<String, String> {
            self.output.clone()
        }
    }

    async fn registry_with(names: &[&str]) -> Arc<ButlerRegistry> {
        let store = Arc::new(MemoryRegistryStore::new());
        let registry = Arc::new(ButlerRegistry::new(store, 3, 600));
        let now = Utc::now();
        for name in names {
            registry
                .register(RegistryRecord {
                    name: (*name).into(),
                    endpoint_url: format!("http://127.0.0.1:9000/{name}"),
                    route_contract_min: 1,
                    route_contract_max: 1,
                    capabilities: vec![],
                    description: format!("{name} butler"),
                    eligibility_state: EligibilityState::Active,
                    last_heartbeat_at: now,
                    liveness_ttl_s: 180,
                    quarantine_reason: None,
                    first_seen_at: now,
                })
                .await
                .unwrap();
        }
        registry
    }

    fn classifier(registry: Arc<ButlerRegistry>, output: Result<String, String>) -> Classifier {
        Classifier::new(registry, Arc::new(ScriptedInvoker { output }))
    }

    const MULTI_DOMAIN: &str = r#"[
        {"butler": "health", "prompt": "Log weight 80kg", "segment": {"rationale": "weight tracking"}},
        {"butler": "relationship", "prompt": "Remind me to call Sarah", "segment": {"rationale": "social reminder"}, "confidence": 0.92}
    ]"#;

    #[tokio::test]
    async fn test_multi_domain_decomposition() {
        let registry = registry_with(&["health", "relationship"]).await;
        let classifier = classifier(registry, Ok(MULTI_DOMAIN.to_string()));
        let entries = classifier
            .classify("Log my weight 80kg and remind me to call Sarah", Utc::now())
            .await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].butler.as_str(), "health");
        assert_eq!(entries[1].butler.as_str(), "relationship");
        // Unknown extra fields (confidence) are ignored.
    }

    #[tokio::test]
    async fn test_array_embedded_in_prose() {
        let registry = registry_with(&["health"]).await;
        let output = format!(
            "Here is the routing:\n[{}]\nDone.",
            r#"{"butler": "health", "prompt": "p", "segment": {"rationale": "r"}}"#
        );
        let classifier = classifier(registry, Ok(output));
        let entries = classifier.classify("text", Utc::now()).await;
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_butler_dropped() {
        let registry = registry_with(&["health", "errand"]).await;
        registry
            .operator_quarantine(&"errand".into(), "manual", Utc::now())
            .await
            .unwrap();
        let output = r#"[
            {"butler": "health", "prompt": "p", "segment": {"rationale": "r"}},
            {"butler": "errand", "prompt": "q", "segment": {"rationale": "r"}}
        ]"#;
        let classifier = classifier(registry, Ok(output.to_string()));
        let entries = classifier.classify("text", Utc::now()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].butler.as_str(), "health");
    }

    #[tokio::test]
    async fn test_partial_parse_keeps_good_entries() {
        let registry = registry_with(&["health"]).await;
        let output = r#"[
            {"butler": "health"},
            {"butler": "health", "prompt": "p", "segment": {}},
            {"butler": "health", "prompt": "p", "segment": {"rationale": "r"}}
        ]"#;
        let classifier = classifier(registry, Ok(output.to_string()));
        let entries = classifier.classify("text", Utc::now()).await;
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_invoker_failure_falls_back_to_general() {
        let registry = registry_with(&["health"]).await;
        let classifier = classifier(registry, Err("adapter crashed".to_string()));
        let entries = classifier.classify("original text", Utc::now()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].butler.as_str(), FALLBACK_BUTLER);
        assert_eq!(entries[0].prompt, "original text");
        assert_eq!(entries[0].segment["rationale"], "fallback");
    }

    #[tokio::test]
    async fn test_garbage_output_falls_back() {
        let registry = registry_with(&["health"]).await;
        let classifier = classifier(registry, Ok("I could not decide.".to_string()));
        let entries = classifier.classify("text", Utc::now()).await;
        assert_eq!(entries[0].butler.as_str(), FALLBACK_BUTLER);
    }

    #[tokio::test]
    async fn test_empty_registry_falls_back() {
        let registry = registry_with(&[]).await;
        let classifier = classifier(registry, Ok(MULTI_DOMAIN.to_string()));
        let entries = classifier.classify("text", Utc::now()).await;
        assert_eq!(entries[0].butler.as_str(), FALLBACK_BUTLER);
    }
}
