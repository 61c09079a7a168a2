//! # Topic Codec Module
//!
//! Everything that turns structured payloads into bytes and back, plus the
//! hierarchical topic naming used to multiplex logical streams over one
//! physical channel.
//!
//! - **`topic`**: `TopicPattern`, dot-separated names with `*` (one token) and
//!   `>` (one or more trailing tokens) wildcards.
//! - **`frame`**: the wire envelope (`Frame`) and the stateless `TopicCodec`
//!   trait with its JSON implementation.

/// Hierarchical topic names and wildcard matching.
pub mod topic;
/// Wire envelope and the JSON codec.
pub mod frame;

pub use frame::{Frame, JsonCodec, TopicCodec, HEARTBEAT_ACK, HEARTBEAT_ALIVE, HEARTBEAT_PING, INBOX_PREFIX};
pub use topic::TopicPattern;
