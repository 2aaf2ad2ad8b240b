//! Butlers Daemon - One process hosting the butler fleet.
//!
//! This crate wires every subsystem together: module loading with cascade
//! failure tracking, core and module tool registration behind approval
//! gates, the jsonrpsee mesh listener, the switchboard's ingest pipeline,
//! and the ordered startup/shutdown of all background loops.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod lifecycle;
mod mesh;
mod module;
mod pipeline;
mod rpc;
mod tools;

pub use error::{DaemonError, DaemonResult};
pub use lifecycle::{ButlerHandle, Daemon, StorageMode, SwitchboardShared};
pub use mesh::JsonRpcMeshConnector;
pub use module::{Module, ModuleLoader, ModuleState};
pub use rpc::{ButlerRpcClient, ButlerRpcServer, ButlerStatus};
pub use tools::{ButlerTool, ToolContext, ToolRegistry};
