//! Error types for the flagsync client.

use std::time::Duration;

use flagsync_core::{FeatureType, ProtocolError};
use thiserror::Error;

/// Errors that can occur when using the feature client.
#[derive(Debug, Error)]
pub enum FlagsError {
    /// Transport failure. Retried by the session, never returned by reads.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server refused to serve this client. Not retried.
    #[error("terminal server error: {0}")]
    TerminalServer(String),

    /// The requested feature key is not known.
    #[error("feature not found: {0}")]
    NotFound(String),

    /// The stored value cannot be read as the requested type.
    #[error("type mismatch for {key}: expected {expected}, found {actual}")]
    TypeMismatch {
        key: String,
        expected: FeatureType,
        actual: String,
    },

    /// No notifiers are registered for the key.
    #[error("no notifiers registered for {0}")]
    NotifierNotFound(String),

    /// Waiting for data exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The client was closed.
    #[error("client shut down")]
    Shutdown,

    /// Client configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An analytics collector failed.
    #[error("analytics error: {0}")]
    Analytics(String),
}

impl FlagsError {
    /// Whether the session should reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlagsError::Connection(_))
    }
}

impl From<reqwest::Error> for FlagsError {
    fn from(e: reqwest::Error) -> Self {
        FlagsError::Connection(e.to_string())
    }
}
