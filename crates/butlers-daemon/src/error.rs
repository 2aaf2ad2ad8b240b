//! Daemon error types.

use thiserror::Error;

/// Errors raised while assembling or running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration was unusable.
    #[error(transparent)]
    Config(#[from] butlers_config::ConfigError),

    /// The persistence layer failed during startup.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),

    /// The registry failed during startup.
    #[error(transparent)]
    Registry(#[from] butlers_registry::RegistryError),

    /// The scheduler failed during startup.
    #[error(transparent)]
    Scheduler(#[from] butlers_scheduler::SchedulerError),

    /// The runtime adapter could not be prepared.
    #[error(transparent)]
    Runtime(#[from] butlers_runtime::RuntimeError),

    /// Telemetry setup failed.
    #[error(transparent)]
    Telemetry(#[from] butlers_telemetry::TelemetryError),

    /// The mesh listener failed to start.
    #[error("mesh listener error: {0}")]
    Listener(String),

    /// A module dependency graph problem (cycle or unknown dependency).
    #[error("module graph error: {0}")]
    ModuleGraph(String),
}

/// Result alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
