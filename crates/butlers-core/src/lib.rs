//! Butlers Core - Foundation types for the butler orchestration core.
//!
//! This crate provides:
//! - Newtype identifiers used throughout the pipeline
//! - The canonical cross-layer error taxonomy
//! - Wire envelopes (`ingest.v1`, `route.v1`, `connector.heartbeat.v1`)
//!   with boundary validation and dedupe-key derivation
//! - Retry utilities with jittered exponential backoff

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod retry;
pub mod route;
pub mod types;

pub use envelope::{
    Channel, IngestEnvelope, IngestPayload, IngestSource, PolicyTier, Provider, dedupe_key,
};
pub use error::{CoreError, CoreResult, ErrorClass, ErrorBody};
pub use heartbeat::{ConnectorHeartbeat, ConnectorState, clamp_heartbeat_interval};
pub use retry::{RetryConfig, retry};
pub use route::{RouteContext, RouteEnvelope, RouteResponse};
pub use types::{
    ActionId, ButlerName, IngressId, RequestId, SessionId, SubrequestId, TriggerSource,
};
