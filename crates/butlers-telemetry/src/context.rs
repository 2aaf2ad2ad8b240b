//! Request context carried through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trace::TraceContext;

/// Correlation context for one unit of pipeline work.
///
/// Created at ingest (or at a scheduler firing) and handed down through
/// classification, dispatch, and routing so every log line and route call
/// shares one trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Unique id of this context.
    pub context_id: Uuid,
    /// Component that created the context.
    pub source: String,
    /// Operation in flight.
    pub operation: Option<String>,
    /// Distributed trace context.
    pub trace: TraceContext,
    /// When this context was created.
    pub started_at: DateTime<Utc>,
}

impl RequestContext {
    /// Create a root context, picking up an ambient `TRACEPARENT` when set.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        let trace = TraceContext::from_env().map_or_else(TraceContext::new_root, |t| t.child());
        Self {
            context_id: Uuid::new_v4(),
            source: source.into(),
            operation: None,
            trace,
            started_at: Utc::now(),
        }
    }

    /// Derive a child context for a downstream hop.
    #[must_use]
    pub fn child(&self, source: impl Into<String>) -> Self {
        Self {
            context_id: Uuid::new_v4(),
            source: source.into(),
            operation: self.operation.clone(),
            trace: self.trace.child(),
            started_at: Utc::now(),
        }
    }

    /// Set the operation name.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Elapsed time since creation, in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }

    /// Create a tracing span carrying the correlation fields.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "request",
            context_id = %self.context_id,
            source = %self.source,
            operation = self.operation.as_deref().unwrap_or(""),
            trace_id = %self.trace.trace_id,
        )
    }
}
