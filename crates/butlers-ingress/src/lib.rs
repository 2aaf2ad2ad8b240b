//! Butlers Ingress - From connector envelope to routed work.
//!
//! The ingest path is two-level: a bounded in-memory priority queue for
//! the hot path and a durable `ingress_queue` table underneath it. A
//! crash between "accepted" and "routed" loses nothing: the cold-path
//! scanner re-enqueues any row whose lease lapsed. When the in-memory
//! queue is full, new work is persisted only (backpressure) and the
//! scanner picks it up as workers free slots.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod api;
mod buffer;
mod error;
mod scanner;
mod worker;

pub use api::{IngestApi, IngestResponse};
pub use buffer::{BufferItem, IngressBuffer};
pub use error::{IngressError, IngressResult};
pub use scanner::run_scanner;
pub use worker::{IngressProcessor, ProcessOutcome, run_worker};
