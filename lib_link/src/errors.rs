//! Error taxonomy for the connection and lifecycle layer.

use thiserror::Error;

/// Failures of the Topic Codec. Always scoped to a single frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode frame for topic '{topic}': {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed inbound frame: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LinkError {
    /// Send or publish attempted while the endpoint has no Open channel.
    #[error("channel to {endpoint} is not open")]
    ChannelNotReady { endpoint: String },

    #[error("request on '{topic}' timed out after {timeout_ms} ms")]
    RequestTimeout { topic: String, timeout_ms: u64 },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no page module registered for route '{route}'")]
    RouteNotFound { route: String },

    /// Cleanup returned while subscriptions owned by the module were still registered.
    #[error("page '{route}' left {count} subscription(s) registered after cleanup: {topics:?}")]
    SubscriptionLeak {
        route: String,
        count: usize,
        topics: Vec<String>,
    },

    #[error("'{owner}' already holds a subscription on '{topic}'")]
    DuplicateSubscription { topic: String, owner: String },

    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("invalid endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to load page module for '{route}': {reason}")]
    ModuleLoad { route: String, reason: String },

    #[error("page '{route}' failed to initialise: {reason}")]
    ModuleInit { route: String, reason: String },

    /// Work from a page activation that has since been superseded.
    #[error("activation of '{route}' is no longer current")]
    StaleActivation { route: String },

    #[error("connection manager is shut down")]
    Shutdown,
}

impl LinkError {
    /// True for failures the caller may retry without changing anything.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::ChannelNotReady { .. } | LinkError::RequestTimeout { .. } | LinkError::Transport(_)
        )
    }
}
