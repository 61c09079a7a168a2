//! # In-Memory Broker
//!
//! A small backend that speaks the JSON envelope over in-process queues. It
//! keeps per-connection wire subscriptions, fans published messages out to
//! matching connections, answers requests through registered responders and
//! can drop or refuse connections on demand. Every frame it receives is
//! recorded so tests can inspect exactly what a client put on the wire.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{sink, stream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Connector, Endpoint, Link, LinkMessage};
use crate::codec::{Frame, JsonCodec, TopicCodec, TopicPattern};
use crate::errors::LinkError;

type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

struct Route {
    delay: Option<Duration>,
    responder: Responder,
}

struct Connection {
    endpoint: Endpoint,
    patterns: Vec<TopicPattern>,
    to_client: mpsc::UnboundedSender<Result<LinkMessage, LinkError>>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    refused: HashSet<Endpoint>,
    connections: HashMap<u64, Connection>,
    connects: HashMap<Endpoint, usize>,
    responders: HashMap<String, Route>,
    received: Vec<(Endpoint, Frame)>,
}

/// Handle to the in-process broker. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            backend: self.clone(),
        }
    }

    /// Refuse (or accept again) new connections to `endpoint`.
    pub fn set_accepting(&self, endpoint: &Endpoint, accepting: bool) {
        let mut state = self.state.lock();
        if accepting {
            state.refused.remove(endpoint);
        } else {
            state.refused.insert(endpoint.clone());
        }
    }

    /// Number of successful connects made to `endpoint` so far.
    pub fn connect_count(&self, endpoint: &Endpoint) -> usize {
        self.state.lock().connects.get(endpoint).copied().unwrap_or(0)
    }

    pub fn live_connections(&self, endpoint: &Endpoint) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| &c.endpoint == endpoint)
            .count()
    }

    /// Force-close every live link to `endpoint` with a server-side close code.
    pub fn drop_connections(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock();
        state.connections.retain(|_, conn| {
            if &conn.endpoint != endpoint {
                return true;
            }
            let _ = conn.to_client.send(Ok(LinkMessage::Closed {
                code: Some(1012),
                reason: "service restart".to_string(),
            }));
            false
        });
    }

    /// Deliver `data` on `topic` to every connection whose wire subscriptions match.
    /// Returns how many connections received it.
    pub fn publish(&self, topic: &str, data: Value) -> usize {
        let state = self.state.lock();
        fan_out(&state, topic, &data)
    }

    /// Push raw bytes to every connection on `endpoint`, bypassing the codec.
    pub fn send_raw(&self, endpoint: &Endpoint, bytes: Bytes) {
        let state = self.state.lock();
        for conn in state.connections.values().filter(|c| &c.endpoint == endpoint) {
            let _ = conn.to_client.send(Ok(LinkMessage::Data(bytes.clone())));
        }
    }

    /// Answer requests on `topic` immediately. Returning `None` leaves the request unanswered.
    pub fn respond<F>(&self, topic: &str, responder: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.register_route(topic, None, Arc::new(responder));
    }

    /// Answer requests on `topic` after `delay`.
    pub fn respond_after<F>(&self, topic: &str, delay: Duration, responder: F)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.register_route(topic, Some(delay), Arc::new(responder));
    }

    /// Wire subscriptions currently held by connections to `endpoint`.
    pub fn wire_subscriptions(&self, endpoint: &Endpoint) -> Vec<String> {
        let state = self.state.lock();
        let mut topics: Vec<String> = state
            .connections
            .values()
            .filter(|c| &c.endpoint == endpoint)
            .flat_map(|c| c.patterns.iter().map(|p| p.to_string()))
            .collect();
        topics.sort();
        topics
    }

    /// Every frame received from clients of `endpoint`, in arrival order.
    pub fn received(&self, endpoint: &Endpoint) -> Vec<Frame> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(ep, _)| ep == endpoint)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn clear_received(&self) {
        self.state.lock().received.clear();
    }

    fn register_route(&self, topic: &str, delay: Option<Duration>, responder: Responder) {
        self.state
            .lock()
            .responders
            .insert(topic.to_string(), Route { delay, responder });
    }

    fn accept(&self, endpoint: &Endpoint) -> Result<Link, LinkError> {
        let (client_tx, mut from_client) = mpsc::unbounded_channel::<Bytes>();
        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<LinkMessage, LinkError>>();

        let id = {
            let mut state = self.state.lock();
            if state.refused.contains(endpoint) {
                return Err(LinkError::Transport(format!("connection to {endpoint} refused")));
            }
            state.next_id += 1;
            let id = state.next_id;
            *state.connects.entry(endpoint.clone()).or_insert(0) += 1;
            state.connections.insert(
                id,
                Connection {
                    endpoint: endpoint.clone(),
                    patterns: Vec::new(),
                    to_client,
                },
            );
            id
        };
        debug!("Memory broker accepted connection {} on {}", id, endpoint);

        let backend = self.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(bytes) = from_client.recv().await {
                backend.handle_client_frame(id, &endpoint, &bytes);
            }
            backend.state.lock().connections.remove(&id);
            debug!("Memory broker connection {} on {} ended", id, endpoint);
        });

        let sink = sink::unfold(client_tx, |tx, frame: Bytes| async move {
            tx.send(frame)
                .map_err(|_| LinkError::Transport("memory link closed".to_string()))?;
            Ok::<_, LinkError>(tx)
        });
        let stream = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn handle_client_frame(&self, id: u64, endpoint: &Endpoint, bytes: &[u8]) {
        let frame = match JsonCodec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Memory broker ignored malformed client frame: {}", e);
                return;
            }
        };
        trace!("Memory broker <- {:?}", frame);

        let mut state = self.state.lock();
        state.received.push((endpoint.clone(), frame.clone()));

        match frame {
            Frame::Sub { topic } => {
                if let (Ok(pattern), Some(conn)) =
                    (TopicPattern::parse(&topic), state.connections.get_mut(&id))
                {
                    if !conn.patterns.contains(&pattern) {
                        conn.patterns.push(pattern);
                    }
                }
            }
            Frame::Unsub { topic } => {
                if let Some(conn) = state.connections.get_mut(&id) {
                    conn.patterns.retain(|p| p.as_str() != topic);
                }
            }
            Frame::Pub {
                topic,
                data,
                reply_to,
            } => {
                fan_out(&state, &topic, &data);
                let Some(reply_to) = reply_to else { return };
                let Some(route) = state.responders.get(&topic) else { return };
                let Some(reply) = (route.responder)(&data) else { return };
                let Some(conn) = state.connections.get(&id) else { return };

                let to_client = conn.to_client.clone();
                let delay = route.delay;
                drop(state);
                send_reply(to_client, reply_to, reply, delay);
            }
            Frame::Msg { .. } | Frame::Heartbeat { .. } => {}
        }
    }
}

fn fan_out(state: &BrokerState, topic: &str, data: &Value) -> usize {
    let mut delivered = 0;
    for conn in state.connections.values() {
        if !conn.patterns.iter().any(|p| p.matches(topic)) {
            continue;
        }
        let frame = Frame::Msg {
            topic: topic.to_string(),
            data: data.clone(),
        };
        if let Ok(bytes) = JsonCodec.encode(&frame) {
            if conn.to_client.send(Ok(LinkMessage::Data(bytes))).is_ok() {
                delivered += 1;
            }
        }
    }
    delivered
}

fn send_reply(
    to_client: mpsc::UnboundedSender<Result<LinkMessage, LinkError>>,
    reply_to: String,
    data: Value,
    delay: Option<Duration>,
) {
    let frame = Frame::Msg {
        topic: reply_to,
        data,
    };
    let Ok(bytes) = JsonCodec.encode(&frame) else { return };

    match delay {
        None => {
            let _ = to_client.send(Ok(LinkMessage::Data(bytes)));
        }
        Some(delay) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = to_client.send(Ok(LinkMessage::Data(bytes)));
            });
        }
    }
}

/// `Connector` backed by a `MemoryBackend`.
#[derive(Clone)]
pub struct MemoryConnector {
    backend: MemoryBackend,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, LinkError> {
        self.backend.accept(endpoint)
    }
}
