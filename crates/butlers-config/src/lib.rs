//! Butlers Config - Roster and daemon configuration.
//!
//! Configuration comes from two places:
//! - `roster.toml`: the butler fleet (names, ports, schemas, modules,
//!   schedules) plus daemon tunables
//! - The process environment: database settings (`DATABASE_URL` /
//!   `POSTGRES_*`), credential store schema, connector runtime settings
//!
//! Everything is parsed into explicit structs at startup; no component
//! reads the environment after boot.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod db;
mod error;
mod loader;
mod types;

pub use db::{DbSettings, SslMode};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_roster, load_roster_str};
pub use types::{
    AdapterKind, ButlerConfig, ConnectorSettings, DaemonTunables, DispatchMode, GateConfig,
    RosterConfig, ScheduleConfig,
};
