//! Error types for the updates crate

use thiserror::Error;
use workpulse_http::{HttpError, Retryable};
use workpulse_process::ProcessError;

use crate::state::{UpdateEvent, UpdateState};

/// Result type alias for update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Error type for update operations
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Version string did not match `MAJOR.MINOR.PATCH[-PRE][+BUILD]`
    #[error("Malformed version '{input}': {reason}")]
    MalformedVersion { input: String, reason: String },

    /// Metadata endpoint unreachable, returned an error or an unparseable body
    #[error("Update check failed: {message}")]
    MetadataFetch { message: String, transient: bool },

    /// Artifact download failed; always retried up to the retry ceiling
    #[error("Download failed: {message}")]
    Download { message: String },

    /// Checksum or signature mismatch
    #[error("Integrity check failed: {message}")]
    Integrity { message: String },

    /// Backup archive could not be created
    #[error("Backup failed: {message}")]
    Backup { message: String },

    /// Installer failed, timed out or could not be launched
    #[error("Installation failed: {message}")]
    Install { message: String },

    /// Rollback itself failed; the installation is in an unknown state
    #[error("Restore failed: {message}")]
    Restore { message: String },

    /// Operator or shutdown requested an abort at a safe point
    #[error("Update cancelled")]
    Cancelled,

    /// Another update sequence is already in flight
    #[error("An update is already in progress (state: {state})")]
    Busy { state: UpdateState },

    /// The state machine rejected an event
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: UpdateState, event: UpdateEvent },

    /// Hosting service could not be stopped or started
    #[error("Service control failed: {message}")]
    ServiceControl { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors in status or manifest files
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Child process errors
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

impl UpdateError {
    /// Create a new metadata fetch error
    pub fn metadata<S: Into<String>>(message: S, transient: bool) -> Self {
        Self::MetadataFetch {
            message: message.into(),
            transient,
        }
    }

    /// Create a new download error
    pub fn download<S: Into<String>>(message: S) -> Self {
        Self::Download {
            message: message.into(),
        }
    }

    /// Create a new integrity error
    pub fn integrity<S: Into<String>>(message: S) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create a new backup error
    pub fn backup<S: Into<String>>(message: S) -> Self {
        Self::Backup {
            message: message.into(),
        }
    }

    /// Create a new installation error
    pub fn install<S: Into<String>>(message: S) -> Self {
        Self::Install {
            message: message.into(),
        }
    }

    /// Create a new restore error
    pub fn restore<S: Into<String>>(message: S) -> Self {
        Self::Restore {
            message: message.into(),
        }
    }

    /// Create a new service control error
    pub fn service<S: Into<String>>(message: S) -> Self {
        Self::ServiceControl {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Metadata fetch error from an HTTP failure
    pub fn metadata_from_http(error: HttpError) -> Self {
        let transient = error.is_retryable();
        Self::metadata(error.to_string(), transient)
    }

    /// Download error from an HTTP failure
    pub fn download_from_http(error: HttpError) -> Self {
        Self::download(error.to_string())
    }

    /// Whether the error class is retried with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Self::MetadataFetch { transient, .. } => *transient,
            Self::Download { .. } => true,
            _ => false,
        }
    }
}

impl Retryable for UpdateError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}
