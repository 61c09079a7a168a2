//! # Channel
//!
//! One physical connection to one `Endpoint` and its reconnect state machine.
//!
//! A channel owns at most one live link at a time. A background driver task
//! connects, pumps frames in both directions, and after any close that the
//! caller did not ask for waits out the backoff delay and tries again.
//! Everything the driver observes is reported, in order, on a single event
//! stream that the connection manager consumes.
//!
//! Outbound frames are queued per link: when a link drops, whatever was still
//! queued for it is discarded. Reconnecting never replays application
//! messages.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::backoff::BackoffPolicy;
use crate::errors::LinkError;
use crate::transport::{Connector, Endpoint, Link, LinkMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
    /// Set when the close came from `Channel::close`.
    pub manual: bool,
}

impl CloseInfo {
    fn dropped(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            manual: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    Connecting { attempt: u32 },
    /// A new link is up. `epoch` increments with every successful open.
    Opened { epoch: u64 },
    Frame { epoch: u64, bytes: Bytes },
    Closed(CloseInfo),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub endpoint: Endpoint,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub backoff: BackoffPolicy,
    /// Treat the link as dropped when nothing arrives for this long.
    pub inactivity_timeout: Option<Duration>,
}

struct ChannelInner {
    state: ChannelState,
    attempts: u32,
    epoch: u64,
    link_tx: Option<mpsc::UnboundedSender<Bytes>>,
    manual_close: bool,
    close_reason: Option<String>,
    cancel: CancellationToken,
    running: bool,
}

struct ChannelShared {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    options: ChannelOptions,
    events: mpsc::UnboundedSender<ChannelEvent>,
    inner: Mutex<ChannelInner>,
}

/// Handle to a channel. Clones share the same physical link.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Channel")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &inner.state)
            .field("attempts", &inner.attempts)
            .field("epoch", &inner.epoch)
            .finish()
    }
}

impl Channel {
    /// Creates a closed channel. Nothing happens until `open()`.
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        options: ChannelOptions,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                endpoint,
                connector,
                options,
                events,
                inner: Mutex::new(ChannelInner {
                    state: ChannelState::Closed,
                    attempts: 0,
                    epoch: 0,
                    link_tx: None,
                    manual_close: false,
                    close_reason: None,
                    cancel: CancellationToken::new(),
                    running: false,
                }),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ChannelState {
        self.shared.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Failed or closed transitions since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.shared.inner.lock().attempts
    }

    /// Number of successful opens so far; identifies the current link.
    pub fn epoch(&self) -> u64 {
        self.shared.inner.lock().epoch
    }

    /// Starts the driver. A no-op while the channel is connecting, open, or
    /// waiting out a backoff delay.
    pub fn open(&self) {
        let cancel = {
            let mut inner = self.shared.inner.lock();
            if inner.running {
                debug!("Channel to {} already running ({})", self.shared.endpoint, inner.state);
                return;
            }
            inner.running = true;
            inner.manual_close = false;
            inner.close_reason = None;
            inner.cancel = CancellationToken::new();
            inner.cancel.clone()
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.drive(cancel).await;
        });
    }

    /// Hands `bytes` to the current link. Fails unless the channel is Open;
    /// nothing is buffered for a later link.
    pub fn send(&self, bytes: Bytes) -> Result<(), LinkError> {
        let inner = self.shared.inner.lock();
        let not_ready = || LinkError::ChannelNotReady {
            endpoint: self.shared.endpoint.to_string(),
        };

        if inner.state != ChannelState::Open {
            return Err(not_ready());
        }
        match &inner.link_tx {
            Some(tx) => tx.send(bytes).map_err(|_| not_ready()),
            None => Err(not_ready()),
        }
    }

    /// Closes the link and cancels any pending reconnect. No reconnect attempt
    /// follows an explicit close.
    pub fn close(&self, reason: &str) {
        let mut inner = self.shared.inner.lock();
        if inner.manual_close {
            return;
        }
        inner.manual_close = true;
        inner.close_reason = Some(reason.to_string());
        inner.cancel.cancel();
        inner.link_tx = None;
        if matches!(inner.state, ChannelState::Open | ChannelState::Connecting) {
            inner.state = ChannelState::Closing;
        }
        info!("Closing channel to {}: {}", self.shared.endpoint, reason);
    }
}

impl ChannelShared {
    fn emit(&self, kind: ChannelEventKind) {
        let _ = self.events.send(ChannelEvent {
            endpoint: self.endpoint.clone(),
            kind,
        });
    }

    /// Connect, pump, back off, repeat until cancelled.
    async fn drive(&self, cancel: CancellationToken) {
        loop {
            let attempt = {
                let mut inner = self.inner.lock();
                if cancel.is_cancelled() {
                    break;
                }
                inner.state = ChannelState::Connecting;
                inner.attempts
            };
            self.emit(ChannelEventKind::Connecting { attempt });
            debug!("Connecting to {} (attempt {})", self.endpoint, attempt);

            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.connector.connect(&self.endpoint) => Some(result),
            };

            let close = match connected {
                None => None,
                Some(Ok(link)) => match self.mark_open(&cancel) {
                    Some((epoch, outbound)) => Some(self.pump(link, outbound, epoch, &cancel).await),
                    None => None,
                },
                Some(Err(e)) => {
                    warn!("Failed to connect to {}: {}", self.endpoint, e);
                    self.emit(ChannelEventKind::Error(e.to_string()));
                    Some(CloseInfo::dropped(None, e.to_string()))
                }
            };

            if cancel.is_cancelled() {
                break;
            }
            let close = close.unwrap_or_else(|| CloseInfo::dropped(None, "link lost"));

            let attempt = {
                let mut inner = self.inner.lock();
                inner.state = ChannelState::Closed;
                inner.link_tx = None;
                inner.attempts = inner.attempts.saturating_add(1);
                inner.attempts
            };
            self.emit(ChannelEventKind::Closed(close.clone()));

            let delay = self.options.backoff.jittered_delay(attempt);
            info!(
                "Channel to {} closed ({}). Reconnecting in {} ms",
                self.endpoint,
                close.reason,
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        let reason = {
            let mut inner = self.inner.lock();
            inner.state = ChannelState::Closed;
            inner.link_tx = None;
            inner.running = false;
            inner.close_reason.take().unwrap_or_else(|| "closed".to_string())
        };
        self.emit(ChannelEventKind::Closed(CloseInfo {
            code: None,
            reason,
            manual: true,
        }));
        debug!("Channel driver for {} stopped", self.endpoint);
    }

    /// Records a successful open. Returns `None` if a close raced the connect.
    fn mark_open(&self, cancel: &CancellationToken) -> Option<(u64, mpsc::UnboundedReceiver<Bytes>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut inner = self.inner.lock();
            if cancel.is_cancelled() {
                return None;
            }
            inner.state = ChannelState::Open;
            inner.attempts = 0;
            inner.epoch += 1;
            inner.link_tx = Some(tx);
            inner.epoch
        };
        info!("Channel to {} open (epoch {})", self.endpoint, epoch);
        self.emit(ChannelEventKind::Opened { epoch });
        Some((epoch, rx))
    }

    async fn pump(
        &self,
        link: Link,
        mut outbound: mpsc::UnboundedReceiver<Bytes>,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> CloseInfo {
        let Link { mut sink, mut stream } = link;
        let idle_limit = self.options.inactivity_timeout;
        let mut last_inbound = Instant::now();

        loop {
            // A limit too large to represent as an instant never fires.
            let deadline = idle_limit.and_then(|limit| last_inbound.checked_add(limit));
            let watchdog = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return CloseInfo { code: None, reason: "closed by caller".to_string(), manual: true };
                }
                Some(frame) = outbound.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        warn!("Send on {} failed: {}", self.endpoint, e);
                        self.emit(ChannelEventKind::Error(e.to_string()));
                        return CloseInfo::dropped(None, e.to_string());
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(LinkMessage::Data(bytes))) => {
                        last_inbound = Instant::now();
                        self.emit(ChannelEventKind::Frame { epoch, bytes });
                    }
                    Some(Ok(LinkMessage::Closed { code, reason })) => {
                        info!("Peer closed {} (code {:?}): {}", self.endpoint, code, reason);
                        return CloseInfo::dropped(code, reason);
                    }
                    Some(Err(e)) => {
                        warn!("Read error on {}: {}", self.endpoint, e);
                        self.emit(ChannelEventKind::Error(e.to_string()));
                        return CloseInfo::dropped(None, e.to_string());
                    }
                    None => {
                        warn!("Stream to {} ended", self.endpoint);
                        return CloseInfo::dropped(None, "stream ended");
                    }
                },
                _ = watchdog => {
                    warn!(
                        "No inbound traffic on {} for {} ms. Treating link as dropped",
                        self.endpoint,
                        idle_limit.unwrap_or_default().as_millis()
                    );
                    return CloseInfo::dropped(None, "inactivity timeout");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBackend;

    fn endpoint() -> Endpoint {
        Endpoint::parse("mem://backend/ws").unwrap()
    }

    fn channel(backend: &MemoryBackend) -> (Channel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ChannelOptions {
            backoff: BackoffPolicy::new(100, 1_000),
            inactivity_timeout: None,
        };
        (Channel::new(endpoint(), Arc::new(backend.connector()), options, tx), rx)
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_before_open_is_rejected() {
        let backend = MemoryBackend::new();
        let (channel, _events) = channel(&backend);
        assert!(matches!(
            channel.send(Bytes::from_static(b"{}")),
            Err(LinkError::ChannelNotReady { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_idempotent() {
        let backend = MemoryBackend::new();
        let (channel, _events) = channel(&backend);
        channel.open();
        channel.open();
        settle().await;
        channel.open();
        settle().await;

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(backend.connect_count(&endpoint()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_grow_while_refused_and_reset_on_open() {
        let backend = MemoryBackend::new();
        backend.set_accepting(&endpoint(), false);
        let (channel, _events) = channel(&backend);
        channel.open();

        // 100ms * 2, then * 4: two failed attempts land inside 700ms.
        sleep(Duration::from_millis(700)).await;
        assert!(channel.attempts() >= 2);
        assert_ne!(channel.state(), ChannelState::Open);

        backend.set_accepting(&endpoint(), true);
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_stops_reconnecting() {
        let backend = MemoryBackend::new();
        let (channel, mut events) = channel(&backend);
        channel.open();
        settle().await;
        assert!(channel.is_open());

        channel.close("page released");
        settle().await;
        assert_eq!(channel.state(), ChannelState::Closed);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.connect_count(&endpoint()), 1);
        assert!(channel.send(Bytes::from_static(b"{}")).is_err());

        let mut manual_closes = 0;
        while let Ok(event) = events.try_recv() {
            if let ChannelEventKind::Closed(info) = event.kind {
                assert!(info.manual);
                manual_closes += 1;
            }
        }
        assert_eq!(manual_closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_drop_triggers_reconnect_with_new_epoch() {
        let backend = MemoryBackend::new();
        let (channel, _events) = channel(&backend);
        channel.open();
        settle().await;
        assert_eq!(channel.epoch(), 1);

        backend.drop_connections(&endpoint());
        settle().await;
        assert_ne!(channel.state(), ChannelState::Open);

        sleep(Duration::from_millis(250)).await;
        assert!(channel.is_open());
        assert_eq!(channel.epoch(), 2);
        assert_eq!(backend.connect_count(&endpoint()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_is_dropped_by_the_watchdog() {
        let backend = MemoryBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = ChannelOptions {
            backoff: BackoffPolicy::new(100, 100),
            inactivity_timeout: Some(Duration::from_secs(5)),
        };
        let channel = Channel::new(endpoint(), Arc::new(backend.connector()), options, tx);
        channel.open();
        settle().await;
        assert_eq!(channel.epoch(), 1);

        sleep(Duration::from_millis(5_150)).await;
        assert_eq!(channel.epoch(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_inactivity_limit_never_fires() {
        let backend = MemoryBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = ChannelOptions {
            backoff: BackoffPolicy::new(100, 100),
            inactivity_timeout: Some(Duration::MAX),
        };
        let channel = Channel::new(endpoint(), Arc::new(backend.connector()), options, tx);
        channel.open();
        settle().await;

        sleep(Duration::from_secs(3_600)).await;
        assert!(channel.is_open());
        assert_eq!(channel.epoch(), 1);
    }
}
