//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The roster file could not be read.
    #[error("failed to read roster at {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The roster file is not valid TOML.
    #[error("invalid roster TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A semantic violation in the roster.
    #[error("invalid roster: {0}")]
    Invalid(String),

    /// A required environment variable is missing.
    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    /// An environment variable holds an unusable value.
    #[error("invalid value for {name}: {reason}")]
    InvalidEnv {
        /// Variable name.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
