//! # Global Status
//!
//! A single derived Online / Degraded / Offline signal for the whole
//! connection layer. The value is never set directly: it is recomputed from
//! the current channel states and the last health result, and a change
//! notification goes out only when the derived value actually moves.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::core::channel::ChannelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthReport {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalStatus {
    Online,
    Degraded,
    Offline,
}

impl GlobalStatus {
    /// Offline with no open channel. With a probe configured, Online needs a
    /// healthy result and anything else is Degraded. Without a probe an open
    /// channel is Online.
    pub fn derive<I>(states: I, health: Option<HealthReport>, probed: bool) -> Self
    where
        I: IntoIterator<Item = ChannelState>,
    {
        let any_open = states.into_iter().any(|s| s == ChannelState::Open);
        match (any_open, health) {
            (false, _) => GlobalStatus::Offline,
            (true, Some(HealthReport::Healthy)) => GlobalStatus::Online,
            (true, Some(HealthReport::Degraded)) => GlobalStatus::Degraded,
            (true, None) if probed => GlobalStatus::Degraded,
            (true, None) => GlobalStatus::Online,
        }
    }
}

impl fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GlobalStatus::Online => "online",
            GlobalStatus::Degraded => "degraded",
            GlobalStatus::Offline => "offline",
        })
    }
}

/// Single writer of `GlobalStatus`. Recompute and broadcast happen under one
/// lock so listeners see changes in the order they occurred.
pub(crate) struct StatusPublisher {
    current: Mutex<GlobalStatus>,
    tx: broadcast::Sender<GlobalStatus>,
}

impl StatusPublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            current: Mutex::new(GlobalStatus::Offline),
            tx,
        }
    }

    pub(crate) fn current(&self) -> GlobalStatus {
        *self.current.lock()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<GlobalStatus> {
        self.tx.subscribe()
    }

    /// Runs `derive` while holding the status lock and publishes the result if
    /// it differs from the current value. Returns the new value on change.
    pub(crate) fn recompute<F>(&self, derive: F) -> Option<GlobalStatus>
    where
        F: FnOnce() -> GlobalStatus,
    {
        let mut current = self.current.lock();
        let next = derive();
        if next == *current {
            return None;
        }
        info!("Global status: {} -> {}", *current, next);
        *current = next;
        let _ = self.tx.send(next);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelState::*;

    #[test]
    fn derivation_table() {
        assert_eq!(GlobalStatus::derive(Vec::<ChannelState>::new(), None, false), GlobalStatus::Offline);
        assert_eq!(GlobalStatus::derive([Closed, Connecting], None, false), GlobalStatus::Offline);
        assert_eq!(
            GlobalStatus::derive([Closed], Some(HealthReport::Healthy), true),
            GlobalStatus::Offline
        );
        assert_eq!(GlobalStatus::derive([Closed, Open], None, false), GlobalStatus::Online);
        assert_eq!(
            GlobalStatus::derive([Open], Some(HealthReport::Healthy), true),
            GlobalStatus::Online
        );
        assert_eq!(
            GlobalStatus::derive([Open, Closing], Some(HealthReport::Degraded), true),
            GlobalStatus::Degraded
        );
    }

    #[test]
    fn configured_probe_without_a_result_is_degraded() {
        assert_eq!(GlobalStatus::derive([Open], None, true), GlobalStatus::Degraded);
        assert_eq!(GlobalStatus::derive([Connecting], None, true), GlobalStatus::Offline);
    }

    #[test]
    fn unchanged_value_is_not_republished() {
        let publisher = StatusPublisher::new(8);
        let mut rx = publisher.subscribe();

        assert_eq!(publisher.recompute(|| GlobalStatus::Offline), None);
        assert_eq!(publisher.recompute(|| GlobalStatus::Online), Some(GlobalStatus::Online));
        assert_eq!(publisher.recompute(|| GlobalStatus::Online), None);
        assert_eq!(publisher.recompute(|| GlobalStatus::Degraded), Some(GlobalStatus::Degraded));

        assert_eq!(rx.try_recv().unwrap(), GlobalStatus::Online);
        assert_eq!(rx.try_recv().unwrap(), GlobalStatus::Degraded);
        assert!(rx.try_recv().is_err());
        assert_eq!(publisher.current(), GlobalStatus::Degraded);
    }

    #[test]
    fn serialises_lowercase() {
        assert_eq!(serde_json::to_string(&GlobalStatus::Degraded).unwrap(), r#""degraded""#);
        let report: HealthReport = serde_json::from_str(r#""healthy""#).unwrap();
        assert_eq!(report, HealthReport::Healthy);
    }
}
