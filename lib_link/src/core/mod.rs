//! # Core Module
//!
//! The connection layer proper.
//!
//! ## Contained Modules:
//! - **`backoff`**: reconnect delay policy.
//! - **`channel`**: one physical link per endpoint and its reconnect loop.
//! - **`manager`**: the `ConnectionManager`, which owns the channels and
//!   multiplexes subscriptions, publishes and requests over them.
//! - **`status`**: the derived `GlobalStatus` and its publisher.
//! - **`health`**: the optional backend health probe.

pub mod backoff;
pub mod channel;
pub mod health;
pub mod manager;
pub mod status;

pub use backoff::BackoffPolicy;
pub use channel::{Channel, ChannelEvent, ChannelEventKind, ChannelOptions, ChannelState, CloseInfo};
pub use health::HealthProbeConfig;
pub use manager::{
    ConnectionManager, Delivery, InboundError, ManagerOptions, Subscription, SubscriptionId,
    SubscriptionOwner,
};
pub use status::{GlobalStatus, HealthReport};
