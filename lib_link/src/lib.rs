//! # lib_link
//!
//! The connection and page-lifecycle layer shared by every dashboard view
//! (map, logger, sensors, settings, compute, digital twin).
//!
//! - **`codec`**: topic patterns and the JSON wire envelope.
//! - **`core`**: backoff, channels, the connection manager, global status and
//!   the optional health probe.
//! - **`transport`**: the `Connector` seam plus its WebSocket and in-memory
//!   implementations.
//! - **`lifecycle`**: page modules, their scopes, the route registry, history
//!   and the lifecycle controller.
//! - **`configs`** / **`loggers`**: the ambient configuration and logging setup
//!   used by the binaries.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod codec;
pub mod core;
pub mod errors;
pub mod lifecycle;
pub mod transport;

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export the pieces page modules and binaries touch directly.
pub use crate::codec::{Frame, JsonCodec, TopicCodec, TopicPattern};
pub use crate::core::{
    BackoffPolicy, Channel, ChannelState, ConnectionManager, Delivery, GlobalStatus, HealthReport,
    ManagerOptions, Subscription, SubscriptionId, SubscriptionOwner,
};
pub use crate::errors::{CodecError, LinkError};
pub use crate::lifecycle::{
    NavigationReport, PageLifecycleController, PageModule, PageRegistry, PageScope, Route,
};
pub use crate::transport::{Connector, Endpoint};
