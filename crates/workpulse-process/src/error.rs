//! Error types for process management

use std::io;
use thiserror::Error;

/// Process management errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started
    #[error("cannot start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on a running child failed
    #[error("lost track of '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The child overran its timeout and was killed
    #[error("'{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Failed to kill process
    #[error("cannot kill {command}: {message}")]
    Kill { command: String, message: String },

    /// Invalid configuration
    #[error("invalid process configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
