//! Butlers Runtime - Ephemeral LLM-CLI turns, serialized per butler.
//!
//! The [`Spawner`] owns a butler's serial dispatch lock: all sessions for
//! one butler are strictly non-overlapping. Each turn runs through a
//! pluggable [`RuntimeAdapter`] (claude-code, codex, or gemini CLI) inside
//! a scrubbed environment, with an MCP config pointing back at the parent
//! butler so tool calls are captured against the session.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod adapter;
mod cli;
mod error;
mod mcp_config;
mod sandbox;
mod spawner;
pub mod testing;

pub use adapter::{AdapterRequest, AdapterOutcome, AdapterUsage, RuntimeAdapter};
pub use cli::CliAdapter;
pub use error::{RuntimeError, RuntimeResult};
pub use mcp_config::mesh_mcp_config;
pub use sandbox::EnvSandbox;
pub use spawner::{Spawner, SpawnerConfig, TriggerOutcome, TriggerRequest};
