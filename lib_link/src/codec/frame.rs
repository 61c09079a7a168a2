//! # Wire Envelope
//!
//! Every frame exchanged with the backend is one JSON object tagged by `op`:
//!
//! ```text
//! {"op":"sub","topic":"sensors.>"}
//! {"op":"unsub","topic":"sensors.>"}
//! {"op":"pub","topic":"commands.compute_service","data":{...},"reply_to":"_INBOX.<id>"}
//! {"op":"msg","topic":"sensors.boom.temp","data":21.5}
//! {"op":"heartbeat","status":"ping"}
//! ```
//!
//! A reply to a request is an ordinary `msg` whose topic is the request's
//! `reply_to` inbox.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CodecError;

/// Prefix of generated reply topics. The remainder is the correlation id.
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Client keep-alive sent on the heartbeat interval.
pub const HEARTBEAT_PING: &str = "ping";
/// Server keep-alive that expects an acknowledgement.
pub const HEARTBEAT_ALIVE: &str = "alive";
/// Client acknowledgement of a server `alive`.
pub const HEARTBEAT_ACK: &str = "client_ack";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Sub {
        topic: String,
    },
    Unsub {
        topic: String,
    },
    Pub {
        topic: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    Msg {
        topic: String,
        #[serde(default)]
        data: Value,
    },
    Heartbeat {
        status: String,
    },
}

impl Frame {
    /// The topic a frame refers to, if it carries one.
    pub fn topic(&self) -> Option<&str> {
        match self {
            Frame::Sub { topic }
            | Frame::Unsub { topic }
            | Frame::Pub { topic, .. }
            | Frame::Msg { topic, .. } => Some(topic),
            Frame::Heartbeat { .. } => None,
        }
    }

    pub fn heartbeat(status: &str) -> Self {
        Frame::Heartbeat {
            status: status.to_string(),
        }
    }

    /// True for a `msg` addressed to a request inbox.
    pub fn is_reply(&self) -> bool {
        matches!(self, Frame::Msg { topic, .. } if topic.starts_with(INBOX_PREFIX))
    }
}

/// Stateless conversion between frames and the bytes carried by a channel.
pub trait TopicCodec: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError>;
}

/// The JSON envelope spoken by the dashboard backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl TopicCodec for JsonCodec {
    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        serde_json::to_vec(frame)
            .map(Bytes::from)
            .map_err(|source| CodecError::Encode {
                topic: frame.topic().unwrap_or_default().to_string(),
                source,
            })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_without_reply_omits_the_field() {
        let frame = Frame::Pub {
            topic: "settings.update".into(),
            data: json!({"units": "metric"}),
            reply_to: None,
        };
        let bytes = JsonCodec.encode(&frame).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""op":"pub""#));
        assert!(!text.contains("reply_to"));
    }

    #[test]
    fn inbound_message_without_data_defaults_to_null() {
        let frame = JsonCodec
            .decode(br#"{"op":"msg","topic":"logger.status"}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::Msg {
                topic: "logger.status".into(),
                data: Value::Null
            }
        );
        assert!(!frame.is_reply());
    }

    #[test]
    fn replies_are_recognised_by_inbox_prefix() {
        let frame = JsonCodec
            .decode(br#"{"op":"msg","topic":"_INBOX.abc","data":{"ok":true}}"#)
            .unwrap();
        assert!(frame.is_reply());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            JsonCodec.decode(b"{not json"),
            Err(CodecError::Decode(_))
        ));
        assert!(matches!(
            JsonCodec.decode(br#"{"op":"teleport"}"#),
            Err(CodecError::Decode(_))
        ));
    }
}
