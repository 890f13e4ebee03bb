//! Transport abstraction between the streaming session and the wire.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use flagsync_core::StreamMessage;

use crate::FlagsError;

/// Decoded messages from one connection, in arrival order.
///
/// A `Protocol` item means a single message was dropped; any other error
/// ends the connection.
pub type MessageStream = BoxStream<'static, Result<StreamMessage, FlagsError>>;

/// Opens connections to the feature service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and return its message stream.
    ///
    /// Authorization rejections are reported as
    /// [`FlagsError::TerminalServer`]; everything else that prevents a
    /// connection is a [`FlagsError::Connection`].
    async fn connect(&self, server_address: &str, api_key: &str) -> Result<MessageStream, FlagsError>;

    /// Release transport resources once the session is closed.
    async fn close(&self) {}
}

/// Map an HTTP status returned at connect time to an error.
pub(crate) fn status_error(status: u16, body: &str) -> FlagsError {
    match status {
        401 | 403 | 404 => FlagsError::TerminalServer(format!(
            "server rejected the api key (HTTP {})",
            status
        )),
        _ if body.is_empty() => FlagsError::Connection(format!("HTTP {}", status)),
        _ => FlagsError::Connection(format!("HTTP {}: {}", status, body)),
    }
}

/// Path of the feature stream for an api key.
pub(crate) fn stream_url(base: &str, api_key: &str) -> String {
    format!("{}/features/{}", base.trim_end_matches('/'), api_key)
}
