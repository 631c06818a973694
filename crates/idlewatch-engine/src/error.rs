//! Engine error types.

use thiserror::Error;

use crate::instance::StopError;

/// Problems with the configuration file or runtime settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid threshold for {scope}: {minutes} minutes (must be > 0)")]
    InvalidThreshold { scope: String, minutes: u64 },

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid instance {id:?}: {reason}")]
    InvalidInstance { id: String, reason: String },
}

/// Errors that can occur while evaluating or controlling instances.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("state store error: {0}")]
    State(#[from] idlewatch_state::StateError),

    #[error("instance control error: {0}")]
    Stop(#[from] StopError),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
