//! Runtime errors.

use noteum_core::{ConfigError, NoteumError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to initialize tracing: {reason}")]
    Telemetry { reason: String },

    #[error(transparent)]
    Noteum(#[from] NoteumError),

    #[error("Storage context has been torn down")]
    TornDown,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
