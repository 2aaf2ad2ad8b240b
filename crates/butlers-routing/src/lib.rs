//! Butlers Routing - From message text to per-butler sessions.
//!
//! The pipeline: the [`Classifier`] decomposes a message into per-butler
//! entries, the [`FanoutPlan`] arranges them (parallel, ordered, or
//! conditional), the [`Dispatcher`] executes the plan under join/abort
//! policies, and the [`Router`] carries each subrequest to its target over
//! the mesh with a cached client, eligibility gating, and canonical error
//! classes.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod classifier;
mod dispatcher;
mod error;
mod notify;
mod plan;
mod router;

pub use classifier::{ClassificationEntry, Classifier, ClassifierInvoker, FALLBACK_BUTLER};
pub use dispatcher::{Dispatcher, PlanOutcome, SubrequestOutcome, SubrequestRunner};
pub use error::{RouteFailure, RoutingError, RoutingResult};
pub use notify::{NotifyExecutor, NotifyResponse, RouteCallGate, egress_tool_allowed};
pub use plan::{AbortPolicy, FanoutMode, FanoutPlan, JoinPolicy, PlanError, RunIf, Subrequest};
pub use router::{MeshClient, MeshConnector, Router};
