//! Shared fixtures for the workspace integration tests: a memory-backed
//! connection manager with fast backoff, and a page module that records what
//! the controller does to it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lib_link::transport::memory::MemoryBackend;
use lib_link::{
    BackoffPolicy, ConnectionManager, Endpoint, JsonCodec, LinkError, ManagerOptions, PageModule, PageScope,
};
use parking_lot::Mutex;

pub const BACKEND: &str = "mem://backend/ws";

pub fn endpoint() -> Endpoint {
    Endpoint::parse(BACKEND).unwrap()
}

/// 100 ms base, 1 s ceiling, no jitter, no heartbeat.
pub fn fast_options() -> ManagerOptions {
    let mut options = ManagerOptions::new(endpoint());
    options.backoff = BackoffPolicy::new(100, 1_000);
    options.heartbeat_interval = None;
    options
}

pub fn start_manager(backend: &MemoryBackend, options: ManagerOptions) -> ConnectionManager {
    ConnectionManager::start(options, Arc::new(backend.connector()), Arc::new(JsonCodec))
}

/// Lets spawned tasks run; tests use a paused clock, so this costs nothing.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// Ordered record of lifecycle calls across every recording module.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, event: String) {
        self.0.lock().push(event);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Counters one recording module exposes to its test.
#[derive(Clone, Default)]
pub struct Probe {
    pub inits: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
    pub received: Arc<AtomicUsize>,
}

impl Probe {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

/// A page module that subscribes to a fixed topic list and journals its
/// `init` and `cleanup` calls.
pub struct Recorder {
    name: String,
    topics: Vec<String>,
    journal: Journal,
    probe: Probe,
    leaky: bool,
    fail_init: bool,
    init_delay: Option<Duration>,
}

impl Recorder {
    pub fn new(name: &str, topics: &[&str], journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            journal: journal.clone(),
            probe: Probe::default(),
            leaky: false,
            fail_init: false,
            init_delay: None,
        }
    }

    /// `cleanup` forgets to unsubscribe.
    pub fn leaky(mut self) -> Self {
        self.leaky = true;
        self
    }

    /// `init` subscribes, then fails.
    pub fn failing(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }
}

#[async_trait]
impl PageModule for Recorder {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("init:{}", self.name));

        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        for topic in &self.topics {
            let received = Arc::clone(&self.probe.received);
            scope.subscribe(topic, move |_| {
                received.fetch_add(1, Ordering::SeqCst);
            })?;
        }
        if self.fail_init {
            return Err(LinkError::ModuleInit {
                route: self.name.clone(),
                reason: "widget failed to mount".to_string(),
            });
        }
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("cleanup:{}", self.name));
        if !self.leaky {
            scope.unsubscribe_all();
        }
    }
}
