//! # Configuration Modules
//!
//! Layered settings for the connection layer and the page controller:
//! built-in defaults, then an optional JSON file, then overrides supplied by
//! the binary (environment and command line).

/// `LinkConfig` and its layering.
pub mod link_config;

pub use link_config::{ConfigError, LinkConfig};
