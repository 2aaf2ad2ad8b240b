//! Butlers Telemetry - Logging and trace propagation for the butler core.
//!
//! This crate provides:
//! - Configurable logging setup over the tracing ecosystem
//! - W3C `traceparent` parse/format for cross-process trace propagation
//! - A request context carried through the ingest → classify → dispatch
//!   pipeline

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod context;
mod error;
mod logging;
mod trace;

pub use context::RequestContext;
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, setup_logging};
pub use trace::{TRACEPARENT_ENV, TraceContext};
