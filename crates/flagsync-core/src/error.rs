//! Error types for decoding feature service messages.

use thiserror::Error;

/// Errors raised while decoding a single inbound message.
///
/// A protocol error only ever affects the message that produced it; the
/// connection that delivered it stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message kind is not one the client understands.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    /// The message kind requires a payload but none was sent.
    #[error("missing payload for {0} message")]
    MissingPayload(String),

    /// The payload did not match the shape expected for its kind.
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The message bytes were not valid UTF-8.
    #[error("invalid UTF-8 in message: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The message body was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
