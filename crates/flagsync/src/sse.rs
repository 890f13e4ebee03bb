//! Server-sent events connector.
//!
//! `GET {server}/features/{api_key}` with `Accept: text/event-stream`. The
//! SSE event name is the message kind and the event data its JSON payload.

use async_trait::async_trait;
use std::fmt;

use eventsource_stream::{Event, EventStreamError, Eventsource};
use flagsync_core::StreamMessage;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::{debug, info};

use crate::FlagsError;
use crate::config::http_base;
use crate::connector::{Connector, MessageStream, status_error, stream_url};

/// Connector speaking server-sent events over HTTP.
#[derive(Debug, Clone, Default)]
pub struct SseConnector {
    client: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client (proxies, TLS roots).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self, server_address: &str, api_key: &str) -> Result<MessageStream, FlagsError> {
        let url = stream_url(&http_base(server_address), api_key);
        debug!(url = %url, "opening SSE stream");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body.trim()));
        }

        info!("SSE stream established");

        let stream = response
            .bytes_stream()
            .eventsource()
            .map(decode_item)
            .boxed();
        Ok(stream)
    }
}

/// Decode one item of the event stream.
///
/// Invalid UTF-8 is a protocol error. Parser and transport errors mean the
/// stream itself is unusable.
fn decode_item<E: fmt::Display>(
    item: Result<Event, EventStreamError<E>>,
) -> Result<StreamMessage, FlagsError> {
    match item {
        Ok(event) => decode_event(&event),
        Err(EventStreamError::Utf8(e)) => Err(FlagsError::Protocol(e.into())),
        Err(e) => Err(FlagsError::Connection(format!("SSE stream error: {}", e))),
    }
}

fn decode_event(event: &Event) -> Result<StreamMessage, FlagsError> {
    let kind = if event.event.is_empty() {
        "message"
    } else {
        event.event.as_str()
    };
    Ok(StreamMessage::decode(kind, &event.data)?)
}
