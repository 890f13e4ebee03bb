//! WebSocket connector.
//!
//! Connects to `ws(s)://{server}/features/{api_key}`. Every text frame is a
//! JSON envelope `{"type": <kind>, "data": <payload>}`.

use async_trait::async_trait;
use flagsync_core::StreamMessage;
use futures_util::{StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, trace};

use crate::FlagsError;
use crate::config::websocket_base;
use crate::connector::{Connector, MessageStream, status_error, stream_url};

/// Connector speaking JSON envelopes over a WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, server_address: &str, api_key: &str) -> Result<MessageStream, FlagsError> {
        let url = stream_url(&websocket_base(server_address), api_key);
        debug!(url = %url, "opening WebSocket stream");

        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| match e {
            tungstenite::Error::Http(response) => status_error(response.status().as_u16(), ""),
            other => FlagsError::Connection(format!("connection failed: {}", other)),
        })?;

        info!("WebSocket stream established");

        // tungstenite answers pings itself; the write half is not needed
        let (_, read) = ws_stream.split();
        let stream = read
            .filter_map(|frame| future::ready(decode_frame(frame)))
            .boxed();
        Ok(stream)
    }
}

fn decode_frame(
    frame: Result<Message, tungstenite::Error>,
) -> Option<Result<StreamMessage, FlagsError>> {
    match frame {
        Ok(Message::Text(text)) => Some(StreamMessage::decode_envelope(&text).map_err(Into::into)),
        Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
            Ok(text) => Some(StreamMessage::decode_envelope(text).map_err(Into::into)),
            Err(_) => {
                trace!(len = data.len(), "ignoring non-UTF-8 binary frame");
                None
            }
        },
        // Keep-alive traffic resets the idle timer like a heartbeat
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Some(Ok(StreamMessage::Heartbeat)),
        Ok(Message::Close(_)) => Some(Ok(StreamMessage::Bye)),
        Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(FlagsError::Connection(format!("read error: {}", e)))),
    }
}
