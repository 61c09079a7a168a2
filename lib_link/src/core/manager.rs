//! # Connection Manager
//!
//! Owns every `Channel` (one per `Endpoint`), multiplexes topic subscriptions
//! over them and exposes publish, subscribe and request/response to page
//! modules.
//!
//! ## Delivery model
//! - Channel events arrive on one ordered queue consumed by a single event
//!   loop task.
//! - When a channel opens, the loop replays the wire subscriptions of every
//!   live `Subscription` bound to it, in registration order, and only then
//!   marks the link as synced. Inbound frames are delivered only for the
//!   synced link, so nothing reaches a callback before its subscription has
//!   been reissued.
//! - Wire `sub`/`unsub` frames are deduplicated per endpoint: the first local
//!   subscription to a pattern puts it on the wire, the last one to leave
//!   takes it off.
//!
//! ## Locking
//! Status lock, then manager state, then channel. Callbacks are never
//! invoked with a lock held.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec::{
    Frame, TopicCodec, TopicPattern, HEARTBEAT_ACK, HEARTBEAT_ALIVE, HEARTBEAT_PING, INBOX_PREFIX,
};
use crate::core::backoff::BackoffPolicy;
use crate::core::channel::{Channel, ChannelEvent, ChannelEventKind, ChannelOptions, ChannelState};
use crate::core::health::{run_probe, HealthProbeConfig};
use crate::core::status::{GlobalStatus, HealthReport, StatusPublisher};
use crate::errors::LinkError;
use crate::transport::{Connector, Endpoint};

const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub default_endpoint: Endpoint,
    /// Topic prefix to endpoint. The longest matching prefix wins.
    pub routes: Vec<(String, Endpoint)>,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
    pub health: Option<HealthProbeConfig>,
}

impl ManagerOptions {
    pub fn new(default_endpoint: Endpoint) -> Self {
        Self {
            default_endpoint,
            routes: Vec::new(),
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_millis(5_000),
            heartbeat_interval: Some(Duration::from_secs(20)),
            inactivity_timeout: None,
            health: None,
        }
    }

    pub fn with_route(mut self, prefix: impl Into<String>, endpoint: Endpoint) -> Self {
        self.routes.push((prefix.into(), endpoint));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Who a subscription belongs to. The lifecycle controller uses one owner per
/// page activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionOwner(Arc<str>);

impl SubscriptionOwner {
    pub fn new(label: impl AsRef<str>) -> Self {
        Self(Arc::from(label.as_ref()))
    }

    /// A fresh owner nobody else shares.
    pub fn unique() -> Self {
        Self::new(format!("anon-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    owner: SubscriptionOwner,
    endpoint: Endpoint,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn owner(&self) -> &SubscriptionOwner {
        &self.owner
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl From<&Subscription> for SubscriptionId {
    fn from(sub: &Subscription) -> Self {
        sub.id
    }
}

/// One inbound message handed to a subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub data: Value,
    pub endpoint: Endpoint,
}

/// A per-message inbound failure. The channel it arrived on stays up.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundError {
    pub endpoint: Endpoint,
    pub message: String,
}

type Callback = Arc<dyn Fn(Delivery) + Send + Sync>;

struct Entry {
    pattern: TopicPattern,
    owner: SubscriptionOwner,
    endpoint: Endpoint,
    callback: Callback,
    active: Arc<AtomicBool>,
}

impl Entry {
    fn handle(&self, id: SubscriptionId) -> Subscription {
        Subscription {
            id,
            pattern: self.pattern.clone(),
            owner: self.owner.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    channels: HashMap<Endpoint, Channel>,
    /// Epoch of the link whose subscriptions have been replayed.
    synced: HashMap<Endpoint, u64>,
    /// Keyed by id, so iteration is registration order.
    entries: BTreeMap<SubscriptionId, Entry>,
    pending: HashMap<String, oneshot::Sender<Value>>,
    health: Option<HealthReport>,
    shut_down: bool,
}

impl ManagerState {
    fn is_synced(&self, endpoint: &Endpoint, channel: &Channel) -> bool {
        channel.is_open() && self.synced.get(endpoint) == Some(&channel.epoch())
    }

    fn wire_users(&self, endpoint: &Endpoint, pattern: &TopicPattern) -> usize {
        self.entries
            .values()
            .filter(|e| &e.endpoint == endpoint && &e.pattern == pattern)
            .count()
    }
}

struct ManagerInner {
    options: ManagerOptions,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn TopicCodec>,
    state: Mutex<ManagerState>,
    status: StatusPublisher,
    errors: broadcast::Sender<InboundError>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    next_id: AtomicU64,
    health_kick: Arc<Notify>,
    cancel: CancellationToken,
}

/// Shared handle to the connection layer. Clones refer to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("default_endpoint", &self.inner.options.default_endpoint)
            .field("status", &self.inner.status.current())
            .finish()
    }
}

impl ConnectionManager {
    /// Builds the manager and spawns its event loop plus the heartbeat and
    /// health tasks. Must be called inside a tokio runtime.
    pub fn start(options: ManagerOptions, connector: Arc<dyn Connector>, codec: Arc<dyn TopicCodec>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (errors, _) = broadcast::channel(BROADCAST_CAPACITY);
        let heartbeat = options.heartbeat_interval;
        let health = options.health.clone();

        let manager = Self {
            inner: Arc::new(ManagerInner {
                options,
                connector,
                codec,
                state: Mutex::new(ManagerState::default()),
                status: StatusPublisher::new(BROADCAST_CAPACITY),
                errors,
                events_tx,
                next_id: AtomicU64::new(1),
                health_kick: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(manager.clone().run_events(events_rx));
        if let Some(interval) = heartbeat {
            tokio::spawn(manager.clone().run_heartbeat(interval));
        }
        if let Some(config) = health {
            tokio::spawn(run_probe(
                manager.clone(),
                config,
                Arc::clone(&manager.inner.health_kick),
                manager.inner.cancel.clone(),
            ));
        }

        info!(
            "Connection manager started (default endpoint {})",
            manager.inner.options.default_endpoint
        );
        manager
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Endpoint that carries `topic`: longest matching route prefix, else the default.
    pub fn endpoint_for(&self, topic: &str) -> Endpoint {
        self.inner
            .options
            .routes
            .iter()
            .filter(|(prefix, _)| prefix_matches(prefix, topic))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, endpoint)| endpoint.clone())
            .unwrap_or_else(|| self.inner.options.default_endpoint.clone())
    }

    /// Returns the channel for `endpoint`, creating and opening it on first use.
    pub fn get_or_create_channel(&self, endpoint: &Endpoint) -> Result<Channel, LinkError> {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(LinkError::Shutdown);
        }
        Ok(self.channel_locked(&mut state, endpoint))
    }

    fn channel_locked(&self, state: &mut ManagerState, endpoint: &Endpoint) -> Channel {
        if let Some(channel) = state.channels.get(endpoint) {
            channel.open();
            return channel.clone();
        }

        let options = ChannelOptions {
            backoff: self.inner.options.backoff,
            inactivity_timeout: self.inner.options.inactivity_timeout,
        };
        let channel = Channel::new(
            endpoint.clone(),
            Arc::clone(&self.inner.connector),
            options,
            self.inner.events_tx.clone(),
        );
        channel.open();
        state.channels.insert(endpoint.clone(), channel.clone());
        debug!("Created channel for {}", endpoint);
        channel
    }

    /// Subscribes with a fresh owner of its own.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<Subscription, LinkError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.subscribe_owned(&SubscriptionOwner::unique(), topic, callback)
    }

    /// Registers `callback` for `topic` on behalf of `owner`. Takes effect on
    /// the wire immediately if the channel is open, otherwise on the next open.
    pub fn subscribe_owned<F>(
        &self,
        owner: &SubscriptionOwner,
        topic: &str,
        callback: F,
    ) -> Result<Subscription, LinkError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        let pattern = TopicPattern::parse(topic)?;
        let endpoint = self.endpoint_for(pattern.as_str());

        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(LinkError::Shutdown);
        }
        if state
            .entries
            .values()
            .any(|e| &e.owner == owner && e.pattern == pattern)
        {
            return Err(LinkError::DuplicateSubscription {
                topic: pattern.to_string(),
                owner: owner.to_string(),
            });
        }

        let first_on_wire = state.wire_users(&endpoint, &pattern) == 0;
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            pattern: pattern.clone(),
            owner: owner.clone(),
            endpoint: endpoint.clone(),
            callback: Arc::new(callback),
            active: Arc::new(AtomicBool::new(true)),
        };
        let handle = entry.handle(id);
        state.entries.insert(id, entry);

        let channel = self.channel_locked(&mut state, &endpoint);
        if first_on_wire && state.is_synced(&endpoint, &channel) {
            self.send_frame(&channel, &Frame::Sub { topic: pattern.to_string() });
        }

        debug!("{} subscribed to '{}' on {} as {}", owner, pattern, endpoint, id);
        Ok(handle)
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: impl Into<SubscriptionId>) -> bool {
        let id = id.into();
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.remove(&id) else {
            trace!("Unsubscribe of {} ignored: not registered", id);
            return false;
        };
        entry.active.store(false, Ordering::SeqCst);

        if state.wire_users(&entry.endpoint, &entry.pattern) == 0 {
            if let Some(channel) = state.channels.get(&entry.endpoint) {
                if state.is_synced(&entry.endpoint, channel) {
                    self.send_frame(channel, &Frame::Unsub { topic: entry.pattern.to_string() });
                }
            }
        }
        debug!("{} unsubscribed from '{}' ({})", entry.owner, entry.pattern, id);
        true
    }

    pub fn subscriptions_owned_by(&self, owner: &SubscriptionOwner) -> Vec<Subscription> {
        let state = self.inner.state.lock();
        state
            .entries
            .iter()
            .filter(|(_, e)| &e.owner == owner)
            .map(|(id, e)| e.handle(*id))
            .collect()
    }

    /// Removes everything `owner` holds. Returns how many were removed.
    pub fn unsubscribe_owner(&self, owner: &SubscriptionOwner) -> usize {
        self.subscriptions_owned_by(owner)
            .iter()
            .filter(|sub| self.unsubscribe(*sub))
            .count()
    }

    /// Distinct patterns with a live subscription on `endpoint`, in registration order.
    pub fn active_topics(&self, endpoint: &Endpoint) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut topics: Vec<String> = Vec::new();
        for entry in state.entries.values().filter(|e| &e.endpoint == endpoint) {
            if !topics.iter().any(|t| t == entry.pattern.as_str()) {
                topics.push(entry.pattern.to_string());
            }
        }
        topics
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Encodes and sends on the topic's channel. Fails with `ChannelNotReady`
    /// when that channel is not open; nothing is queued.
    pub fn publish(&self, topic: &str, data: Value) -> Result<(), LinkError> {
        self.publish_frame(Frame::Pub {
            topic: topic.to_string(),
            data,
            reply_to: None,
        })
    }

    fn publish_frame(&self, frame: Frame) -> Result<(), LinkError> {
        let topic = frame.topic().unwrap_or_default().to_string();
        if topic.is_empty() {
            return Err(LinkError::InvalidTopic {
                topic,
                reason: "empty topic",
            });
        }
        let endpoint = self.endpoint_for(&topic);

        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(LinkError::Shutdown);
        }
        let channel = self.channel_locked(&mut state, &endpoint);
        let bytes = self.inner.codec.encode(&frame)?;
        channel.send(bytes)
    }

    /// Publishes `data` with a fresh reply inbox and waits for the reply.
    /// The first of reply or timeout wins; a reply arriving later is dropped.
    pub async fn request(&self, topic: &str, data: Value, timeout: Duration) -> Result<Value, LinkError> {
        let reply_to = format!("{}{}", INBOX_PREFIX, Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(LinkError::Shutdown);
            }
            state.pending.insert(reply_to.clone(), tx);
        }
        let _guard = PendingGuard {
            inner: &self.inner,
            reply_to: &reply_to,
        };

        self.publish_frame(Frame::Pub {
            topic: topic.to_string(),
            data,
            reply_to: Some(reply_to.clone()),
        })?;
        trace!("Request on '{}' waiting on {}", topic, reply_to);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::Shutdown),
            Err(_) => {
                debug!("Request on '{}' timed out after {} ms", topic, timeout.as_millis());
                Err(LinkError::RequestTimeout {
                    topic: topic.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// `request` with the configured default timeout.
    pub async fn request_default(&self, topic: &str, data: Value) -> Result<Value, LinkError> {
        self.request(topic, data, self.inner.options.request_timeout).await
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn status(&self) -> GlobalStatus {
        self.inner.status.current()
    }

    /// Ordered stream of status changes. Unchanged recomputations are not sent.
    pub fn status_changes(&self) -> broadcast::Receiver<GlobalStatus> {
        self.inner.status.subscribe()
    }

    /// Per-message inbound failures (malformed frames).
    pub fn errors(&self) -> broadcast::Receiver<InboundError> {
        self.inner.errors.subscribe()
    }

    pub fn channel_state(&self, endpoint: &Endpoint) -> Option<ChannelState> {
        self.inner.state.lock().channels.get(endpoint).map(Channel::state)
    }

    pub fn any_channel_open(&self) -> bool {
        self.inner.state.lock().channels.values().any(Channel::is_open)
    }

    /// Closes and forgets the channel for `endpoint`. Subscriptions bound to it
    /// stay registered and are replayed if the endpoint is used again.
    pub fn release_channel(&self, endpoint: &Endpoint) -> bool {
        let released = {
            let mut state = self.inner.state.lock();
            state.synced.remove(endpoint);
            state.channels.remove(endpoint)
        };
        let Some(channel) = released else {
            return false;
        };
        channel.close("released");
        self.refresh_status();
        true
    }

    /// Closes every channel, drops all subscriptions and fails pending requests.
    pub fn shutdown(&self) {
        let channels = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            for entry in state.entries.values() {
                entry.active.store(false, Ordering::SeqCst);
            }
            state.entries.clear();
            state.pending.clear();
            state.synced.clear();
            state.channels.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };
        for channel in &channels {
            channel.close("manager shutdown");
        }
        self.inner.cancel.cancel();
        self.refresh_status();
        info!("Connection manager shut down ({} channel(s) closed)", channels.len());
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    pub(crate) fn record_health(&self, report: HealthReport) {
        self.inner.state.lock().health = Some(report);
        self.refresh_status();
    }

    fn refresh_status(&self) {
        self.inner.status.recompute(|| {
            let mut state = self.inner.state.lock();
            let states: Vec<ChannelState> = state.channels.values().map(Channel::state).collect();
            if !states.contains(&ChannelState::Open) {
                state.health = None;
            }
            GlobalStatus::derive(states, state.health, self.inner.options.health.is_some())
        });
    }

    fn send_frame(&self, channel: &Channel, frame: &Frame) -> bool {
        let sent = self
            .inner
            .codec
            .encode(frame)
            .map_err(LinkError::from)
            .and_then(|bytes| channel.send(bytes));
        match sent {
            Ok(()) => true,
            Err(e) => {
                debug!("Could not send {:?} on {}: {}", frame, channel.endpoint(), e);
                false
            }
        }
    }

    async fn run_events(self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event);
        }
        debug!("Connection manager event loop stopped");
    }

    fn handle_event(&self, event: ChannelEvent) {
        let ChannelEvent { endpoint, kind } = event;
        match kind {
            ChannelEventKind::Connecting { attempt } => {
                trace!("{} connecting (attempt {})", endpoint, attempt);
            }
            ChannelEventKind::Opened { epoch } => {
                self.resync(&endpoint, epoch);
                self.refresh_status();
                self.inner.health_kick.notify_one();
            }
            ChannelEventKind::Frame { epoch, bytes } => self.dispatch(&endpoint, epoch, &bytes),
            ChannelEventKind::Closed(info) => {
                {
                    let mut state = self.inner.state.lock();
                    // A released channel may report its close after a replacement opened.
                    let replaced = state.channels.get(&endpoint).is_some_and(Channel::is_open);
                    if !replaced {
                        state.synced.remove(&endpoint);
                    }
                }
                if info.manual {
                    debug!("{} closed by caller: {}", endpoint, info.reason);
                } else {
                    warn!("{} dropped (code {:?}): {}", endpoint, info.code, info.reason);
                }
                self.refresh_status();
            }
            ChannelEventKind::Error(message) => {
                debug!("{} reported: {}", endpoint, message);
            }
        }
    }

    /// Replays the wire subscriptions for a freshly opened link.
    fn resync(&self, endpoint: &Endpoint, epoch: u64) {
        let mut state = self.inner.state.lock();
        let Some(channel) = state.channels.get(endpoint).cloned() else {
            return;
        };
        if channel.epoch() != epoch || !channel.is_open() {
            debug!("Skipping resync of stale link {} epoch {}", endpoint, epoch);
            return;
        }

        let mut patterns: Vec<&TopicPattern> = Vec::new();
        for entry in state.entries.values().filter(|e| &e.endpoint == endpoint) {
            if !patterns.contains(&&entry.pattern) {
                patterns.push(&entry.pattern);
            }
        }
        let topics: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();

        for topic in &topics {
            if !self.send_frame(&channel, &Frame::Sub { topic: topic.clone() }) {
                warn!("Resync of {} interrupted; will retry on next open", endpoint);
                return;
            }
        }
        state.synced.insert(endpoint.clone(), epoch);
        info!("{} synced at epoch {} ({} subscription(s))", endpoint, epoch, topics.len());
    }

    fn dispatch(&self, endpoint: &Endpoint, epoch: u64, bytes: &Bytes) {
        if self.inner.state.lock().synced.get(endpoint) != Some(&epoch) {
            trace!("Dropping frame from unsynced link {} epoch {}", endpoint, epoch);
            return;
        }

        let frame = match self.inner.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed frame on {}: {}", endpoint, e);
                let _ = self.inner.errors.send(InboundError {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                });
                return;
            }
        };

        match frame {
            Frame::Msg { topic, data } if topic.starts_with(INBOX_PREFIX) => {
                let waiter = self.inner.state.lock().pending.remove(&topic);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(data);
                    }
                    None => debug!("Discarding late or unknown reply on {}", topic),
                }
            }
            Frame::Msg { topic, data } => {
                let targets: Vec<(Callback, Arc<AtomicBool>)> = {
                    let state = self.inner.state.lock();
                    state
                        .entries
                        .values()
                        .filter(|e| &e.endpoint == endpoint && e.pattern.matches(&topic))
                        .map(|e| (Arc::clone(&e.callback), Arc::clone(&e.active)))
                        .collect()
                };
                if targets.is_empty() {
                    trace!("No subscriber for '{}' on {}", topic, endpoint);
                }
                for (callback, active) in targets {
                    if !active.load(Ordering::SeqCst) {
                        continue;
                    }
                    callback(Delivery {
                        topic: topic.clone(),
                        data: data.clone(),
                        endpoint: endpoint.clone(),
                    });
                }
            }
            Frame::Heartbeat { status } if status == HEARTBEAT_ALIVE => {
                let channel = self.inner.state.lock().channels.get(endpoint).cloned();
                if let Some(channel) = channel {
                    self.send_frame(&channel, &Frame::heartbeat(HEARTBEAT_ACK));
                }
            }
            Frame::Heartbeat { status } => trace!("Heartbeat '{}' from {}", status, endpoint),
            other => debug!("Ignoring unexpected {:?} from {}", other, endpoint),
        }
    }

    async fn run_heartbeat(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let channels: Vec<Channel> = {
                let state = self.inner.state.lock();
                state
                    .channels
                    .iter()
                    .filter(|(endpoint, channel)| state.is_synced(endpoint, channel))
                    .map(|(_, channel)| channel.clone())
                    .collect()
            };
            for channel in &channels {
                self.send_frame(channel, &Frame::heartbeat(HEARTBEAT_PING));
            }
        }
        debug!("Heartbeat task stopped");
    }
}

/// `prefix` matches whole leading tokens of `topic`.
fn prefix_matches(prefix: &str, topic: &str) -> bool {
    match topic.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.') || prefix.ends_with('.'),
        None => false,
    }
}

/// Removes the pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    inner: &'a ManagerInner,
    reply_to: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.inner.state.lock().pending.remove(self.reply_to).is_some() {
            trace!("Dropped pending request {}", self.reply_to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::transport::memory::MemoryBackend;
    use serde_json::json;
    use tokio::time::sleep;

    fn endpoint() -> Endpoint {
        Endpoint::parse("mem://backend/ws").unwrap()
    }

    fn manager(backend: &MemoryBackend) -> ConnectionManager {
        let mut options = ManagerOptions::new(endpoint());
        options.backoff = BackoffPolicy::new(100, 1_000);
        options.heartbeat_interval = None;
        ConnectionManager::start(options, Arc::new(backend.connector()), Arc::new(JsonCodec))
    }

    async fn settle() {
        sleep(Duration::from_millis(5)).await;
    }

    #[test]
    fn route_prefix_respects_token_boundaries() {
        assert!(prefix_matches("sensors", "sensors"));
        assert!(prefix_matches("sensors", "sensors.boom.temp"));
        assert!(prefix_matches("sensors.", "sensors.boom"));
        assert!(!prefix_matches("sensors", "sensorsx.boom"));
        assert!(!prefix_matches("gps", "sensors.gps"));
    }

    #[tokio::test(start_paused = true)]
    async fn longest_route_prefix_wins() {
        let backend = MemoryBackend::new();
        let gps = Endpoint::parse("mem://backend/ws_gps").unwrap();
        let fast = Endpoint::parse("mem://backend/ws_gps_fast").unwrap();
        let options = ManagerOptions::new(endpoint())
            .with_route("gps", gps.clone())
            .with_route("gps.fast", fast.clone());
        let manager = ConnectionManager::start(options, Arc::new(backend.connector()), Arc::new(JsonCodec));

        assert_eq!(manager.endpoint_for("gps.position"), gps);
        assert_eq!(manager.endpoint_for("gps.fast.position"), fast);
        assert_eq!(manager.endpoint_for("logs.app"), endpoint());
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn wire_subscription_is_shared_between_local_subscribers() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        manager.get_or_create_channel(&endpoint()).unwrap();
        settle().await;

        let a = manager.subscribe("sensors.>", |_| {}).unwrap();
        let b = manager.subscribe("sensors.>", |_| {}).unwrap();
        settle().await;
        assert_eq!(backend.wire_subscriptions(&endpoint()), vec!["sensors.>"]);

        assert!(manager.unsubscribe(&a));
        settle().await;
        assert_eq!(backend.wire_subscriptions(&endpoint()), vec!["sensors.>"]);

        assert!(manager.unsubscribe(&b));
        settle().await;
        assert!(backend.wire_subscriptions(&endpoint()).is_empty());

        let subs = backend
            .received(&endpoint())
            .into_iter()
            .filter(|f| matches!(f, Frame::Sub { .. }))
            .count();
        assert_eq!(subs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_owner_topic_pair_is_rejected() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let owner = SubscriptionOwner::new("logger#1");

        manager.subscribe_owned(&owner, "logs.app", |_| {}).unwrap();
        let err = manager.subscribe_owned(&owner, "logs.app", |_| {}).unwrap_err();
        assert!(matches!(err, LinkError::DuplicateSubscription { .. }));

        let other = SubscriptionOwner::new("logger#2");
        assert!(manager.subscribe_owned(&other, "logs.app", |_| {}).is_ok());
        assert_eq!(manager.unsubscribe_owner(&owner), 1);
        assert!(manager.subscriptions_owned_by(&owner).is_empty());
        assert_eq!(manager.subscriptions_owned_by(&other).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_reported_and_channel_survives() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let mut errors = manager.errors();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        manager
            .subscribe("sensors.temp", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        settle().await;

        backend.send_raw(&endpoint(), Bytes::from_static(b"{not json"));
        settle().await;
        let reported = errors.try_recv().unwrap();
        assert_eq!(reported.endpoint, endpoint());

        backend.publish("sensors.temp", json!(21.5));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(manager.channel_state(&endpoint()), Some(ChannelState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn server_alive_is_acknowledged() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        manager.get_or_create_channel(&endpoint()).unwrap();
        settle().await;

        let alive = JsonCodec.encode(&Frame::heartbeat(HEARTBEAT_ALIVE)).unwrap();
        backend.send_raw(&endpoint(), alive);
        settle().await;

        assert!(backend
            .received(&endpoint())
            .contains(&Frame::heartbeat(HEARTBEAT_ACK)));
    }

    #[tokio::test(start_paused = true)]
    async fn status_follows_channel_and_health() {
        let backend = MemoryBackend::new();
        let mut options = ManagerOptions::new(endpoint());
        options.heartbeat_interval = None;
        options.health = Some(HealthProbeConfig {
            topic: "get_status".to_string(),
            interval_ms: 1_000,
            timeout_ms: 200,
        });
        backend.respond("get_status", |_| Some(json!({"status": "degraded"})));
        let manager = ConnectionManager::start(options, Arc::new(backend.connector()), Arc::new(JsonCodec));
        let mut changes = manager.status_changes();

        assert_eq!(manager.status(), GlobalStatus::Offline);
        manager.get_or_create_channel(&endpoint()).unwrap();
        settle().await;

        // The probe has not answered when the channel opens, and then answers degraded.
        assert_eq!(changes.recv().await.unwrap(), GlobalStatus::Degraded);
        assert!(changes.try_recv().is_err());
        assert_eq!(manager.status(), GlobalStatus::Degraded);

        backend.respond("get_status", |_| Some(json!({"status": "healthy"})));
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(changes.recv().await.unwrap(), GlobalStatus::Online);

        manager.shutdown();
        assert_eq!(manager.status(), GlobalStatus::Offline);
        assert_eq!(changes.recv().await.unwrap(), GlobalStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_pending_requests_and_rejects_new_work() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        manager.get_or_create_channel(&endpoint()).unwrap();
        settle().await;

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .request("commands.compute", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        settle().await;
        assert_eq!(manager.pending_requests(), 1);

        manager.shutdown();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(LinkError::Shutdown)));
        assert!(matches!(manager.subscribe("a.b", |_| {}), Err(LinkError::Shutdown)));
        assert!(matches!(manager.publish("a.b", json!(1)), Err(LinkError::Shutdown)));
    }
}
