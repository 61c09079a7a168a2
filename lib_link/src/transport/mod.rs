//! # Transport Module
//!
//! The seam between a `Channel` and the physical link it drives. A channel
//! only ever sees a `Connector`, which produces a `Link`: a sink for outbound
//! frames and a stream of inbound frames and close notifications.
//!
//! ## Contained Modules:
//! - **`ws`**: WebSocket connector on top of `tokio-tungstenite`
//!   (feature `websocket`).
//! - **`memory`**: an in-process broker speaking the JSON envelope, used by
//!   tests and offline demos (feature `testing`).

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::LinkError;

#[cfg(feature = "websocket")]
pub mod ws;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// One physical connection target: `scheme://host[:port]` plus an optional sub-path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    address: String,
    path: Option<String>,
}

impl Endpoint {
    pub fn parse(value: &str) -> Result<Self, LinkError> {
        let invalid = |reason: String| LinkError::InvalidEndpoint {
            value: value.to_string(),
            reason,
        };

        let url = Url::parse(value.trim()).map_err(|e| invalid(e.to_string()))?;
        let scheme = url.scheme();
        if !matches!(scheme, "ws" | "wss" | "mem") {
            return Err(invalid(format!("unsupported scheme '{scheme}'")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?;

        let address = match url.port() {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        let path = match (url.path(), url.query()) {
            ("" | "/", None) => None,
            (path, None) => Some(path.to_string()),
            (path, Some(query)) => Some(format!("{path}?{query}")),
        };

        Ok(Self { address, path })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The full URL handed to the connector.
    pub fn url(&self) -> String {
        match &self.path {
            Some(path) => format!("{}{}", self.address, path),
            None => self.address.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl FromStr for Endpoint {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.url()
    }
}

/// What a link yields on its inbound side.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    Data(Bytes),
    /// The peer closed the link, optionally with a close code.
    Closed { code: Option<u16>, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = LinkError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<LinkMessage, LinkError>> + Send>>;

/// A live physical link, already split into its two halves.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens physical links. One connector is shared by every channel of a manager.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_splits_address_and_path() {
        let endpoint = Endpoint::parse("ws://127.0.0.1:8000/ws_data").unwrap();
        assert_eq!(endpoint.address(), "ws://127.0.0.1:8000");
        assert_eq!(endpoint.path(), Some("/ws_data"));
        assert_eq!(endpoint.url(), "ws://127.0.0.1:8000/ws_data");
    }

    #[test]
    fn bare_host_has_no_path() {
        let endpoint: Endpoint = "wss://dashboard.local/".parse().unwrap();
        assert_eq!(endpoint.path(), None);
        assert_eq!(endpoint.to_string(), "wss://dashboard.local");
    }

    #[test]
    fn non_stream_schemes_are_rejected() {
        assert!(matches!(
            Endpoint::parse("http://localhost/ws"),
            Err(LinkError::InvalidEndpoint { .. })
        ));
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[test]
    fn endpoint_round_trips_through_json_as_a_string() {
        let endpoint = Endpoint::parse("mem://backend/ws_gps").unwrap();
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, r#""mem://backend/ws_gps""#);
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
    }
}
