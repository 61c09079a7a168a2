//! # WebSocket Connector
//!
//! Opens one `tokio-tungstenite` stream per channel and adapts it to the
//! `Link` halves. Text and binary frames are both surfaced as bytes; pings are
//! answered by tungstenite itself and never reach the channel.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tracing::debug;

use super::{Connector, Endpoint, Link, LinkMessage};
use crate::errors::LinkError;

impl From<tungstenite::Error> for LinkError {
    fn from(err: tungstenite::Error) -> Self {
        LinkError::Transport(err.to_string())
    }
}

/// Configuration for the WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, LinkError> {
        let url = endpoint.url();
        debug!("Connecting WebSocket to {}", url);

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                LinkError::Transport(format!(
                    "connect to {} timed out after {}s",
                    url,
                    self.connect_timeout.as_secs()
                ))
            })??;

        let (write, read) = ws_stream.split();

        let sink = write.with(|frame: Bytes| future::ready(Ok::<_, LinkError>(to_message(frame))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(LinkMessage::Data(Bytes::copy_from_slice(
                    text.as_str().as_bytes(),
                )))),
                Ok(Message::Binary(bin)) => Some(Ok(LinkMessage::Data(bin))),
                Ok(Message::Close(frame)) => Some(Ok(LinkMessage::Closed {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                })),
                Ok(_) => None,
                Err(e) => Some(Err(LinkError::from(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// JSON envelopes go out as text frames; anything else as binary.
fn to_message(frame: Bytes) -> Message {
    match String::from_utf8(frame.to_vec()) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}
