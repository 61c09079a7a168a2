//! # Page Modules and Their Scope
//!
//! A `PageModule` is one dashboard view: an `init` and a `cleanup` and nothing
//! else. Everything a module registers while it is active goes through the
//! `PageScope` it is handed, which records a handle for each registration:
//!
//! - topic subscriptions (owned by the activation in the connection manager),
//! - timers and spawned tasks,
//! - status listeners,
//! - owned visual components (`Disposable`).
//!
//! Every callback registered through a scope is gated on the scope's
//! `ActivationToken`. Once the controller moves on, the token goes stale and
//! nothing registered by the old activation fires again, even if the module's
//! own `cleanup` forgot something. `release_all` then tears down whatever is
//! left, exactly once.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::{ConnectionManager, Delivery, GlobalStatus, Subscription, SubscriptionId, SubscriptionOwner};
use crate::errors::LinkError;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A navigation target. Stored without leading or trailing slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route(String);

impl Route {
    pub fn new(path: &str) -> Self {
        Self(path.trim().trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The root path ("/" or "").
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The path form used in history entries.
    pub fn path(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for Route {
    fn from(path: &str) -> Self {
        Route::new(path)
    }
}

/// One dashboard view. `cleanup` must undo everything `init` registered; the
/// scope makes that a list of handle releases.
#[async_trait]
pub trait PageModule: Send + Sync {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError>;

    fn cleanup(&self, scope: &mut PageScope);
}

/// A visual object owned by a page (map, chart, table).
pub trait Disposable: Send + Sync {
    fn dispose(&mut self);
}

/// Identifies one activation. Stale as soon as the controller starts the next
/// transition.
#[derive(Debug, Clone)]
pub struct ActivationToken {
    generation: u64,
    current: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ActivationToken {
    pub(crate) fn new(generation: u64, current: Arc<AtomicU64>) -> Self {
        Self {
            generation,
            current,
            cancel: CancellationToken::new(),
        }
    }

    /// A token nobody invalidates except through `invalidate`.
    pub fn standalone() -> Self {
        Self::new(1, Arc::new(AtomicU64::new(1)))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        !self.cancel.is_cancelled() && self.current.load(Ordering::SeqCst) == self.generation
    }

    /// Resolves once the activation has been superseded.
    pub async fn stale(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn invalidate(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(u64);

/// What `release_all` had to tear down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub subscriptions: usize,
    pub tasks: usize,
    pub components: usize,
}

impl ReleaseSummary {
    pub fn is_empty(&self) -> bool {
        self.subscriptions == 0 && self.tasks == 0 && self.components == 0
    }
}

/// Registration surface for one activation of one page module.
pub struct PageScope {
    route: Route,
    owner: SubscriptionOwner,
    token: ActivationToken,
    manager: ConnectionManager,
    subscriptions: Vec<Subscription>,
    tasks: Vec<(TaskId, JoinHandle<()>)>,
    components: Vec<(ComponentId, String, Box<dyn Disposable>)>,
    next_handle: u64,
    released: bool,
}

impl fmt::Debug for PageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageScope")
            .field("route", &self.route)
            .field("owner", &self.owner)
            .field("subscriptions", &self.subscriptions.len())
            .field("tasks", &self.tasks.len())
            .field("components", &self.components.len())
            .field("released", &self.released)
            .finish()
    }
}

impl PageScope {
    pub fn new(route: Route, token: ActivationToken, manager: ConnectionManager) -> Self {
        let owner = SubscriptionOwner::new(format!("{}#{}", route, token.generation()));
        Self {
            route,
            owner,
            token,
            manager,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
            components: Vec::new(),
            next_handle: 0,
            released: false,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn owner(&self) -> &SubscriptionOwner {
        &self.owner
    }

    pub fn token(&self) -> &ActivationToken {
        &self.token
    }

    pub fn is_current(&self) -> bool {
        self.token.is_current()
    }

    /// A cloneable handle for async work started from `init`.
    pub fn handle(&self) -> ScopeHandle {
        ScopeHandle {
            route: self.route.clone(),
            owner: self.owner.clone(),
            token: self.token.clone(),
            manager: self.manager.clone(),
        }
    }

    /// Subscriptions this scope still tracks.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn subscribe<F>(&mut self, topic: &str, callback: F) -> Result<Subscription, LinkError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.ensure_current()?;
        let token = self.token.clone();
        let sub = self.manager.subscribe_owned(&self.owner, topic, move |delivery| {
            if token.is_current() {
                callback(delivery);
            }
        })?;
        self.subscriptions.push(sub.clone());
        Ok(sub)
    }

    pub fn unsubscribe(&mut self, id: impl Into<SubscriptionId>) -> bool {
        let id = id.into();
        self.subscriptions.retain(|s| s.id() != id);
        self.manager.unsubscribe(id)
    }

    /// Unsubscribes everything this scope tracks. Returns how many were live.
    pub fn unsubscribe_all(&mut self) -> usize {
        let subs = std::mem::take(&mut self.subscriptions);
        subs.iter().filter(|s| self.manager.unsubscribe(*s)).count()
    }

    pub fn publish(&self, topic: &str, data: Value) -> Result<(), LinkError> {
        self.ensure_current()?;
        self.manager.publish(topic, data)
    }

    /// The returned future does not borrow the scope, so `init` can await it.
    pub fn request(
        &self,
        topic: &str,
        data: Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, LinkError>> + Send + 'static {
        let handle = self.handle();
        let topic = topic.to_string();
        async move { handle.request(&topic, data, timeout).await }
    }

    /// Runs `tick` every `period` while the activation is current. Periods
    /// shorter than a millisecond are raised to one.
    pub fn interval<F>(&mut self, period: Duration, mut tick: F) -> TaskId
    where
        F: FnMut() + Send + 'static,
    {
        let token = self.token.clone();
        let period = period.max(MIN_INTERVAL);
        self.spawn_tracked(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.stale() => break,
                    _ = ticker.tick() => {
                        if !token.is_current() {
                            break;
                        }
                        tick();
                    }
                }
            }
        })
    }

    /// Runs `fire` once after `delay` unless the activation is gone by then.
    pub fn timeout<F>(&mut self, delay: Duration, fire: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.token.clone();
        self.spawn_tracked(async move {
            tokio::select! {
                biased;
                _ = token.stale() => {}
                _ = tokio::time::sleep(delay) => {
                    if token.is_current() {
                        fire();
                    }
                }
            }
        })
    }

    /// Spawns `work`, aborted when the activation ends.
    pub fn spawn<Fut>(&mut self, work: Fut) -> TaskId
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.spawn_tracked(async move {
            tokio::select! {
                biased;
                _ = token.stale() => {}
                _ = work => {}
            }
        })
    }

    /// Calls `listener` on every `GlobalStatus` change while current.
    pub fn on_status<F>(&mut self, listener: F) -> TaskId
    where
        F: Fn(GlobalStatus) + Send + 'static,
    {
        let token = self.token.clone();
        let mut changes = self.manager.status_changes();
        self.spawn_tracked(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.stale() => break,
                    change = changes.recv() => match change {
                        Ok(status) if token.is_current() => listener(status),
                        Ok(_) => break,
                        Err(RecvError::Lagged(missed)) => trace!("Status listener lagged by {}", missed),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Stops a timer or task. Returns false if it was not tracked.
    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        match self.tasks.iter().position(|(task, _)| *task == id) {
            Some(index) => {
                let (_, handle) = self.tasks.swap_remove(index);
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stops every timer and task. Returns how many were still running.
    pub fn cancel_all_tasks(&mut self) -> usize {
        let mut running = 0;
        for (_, handle) in self.tasks.drain(..) {
            if !handle.is_finished() {
                running += 1;
            }
            handle.abort();
        }
        running
    }

    pub fn task_count(&self) -> usize {
        self.tasks.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Takes ownership of a visual component. It is disposed exactly once,
    /// either by `dispose` or when the scope is released.
    pub fn own<D>(&mut self, name: &str, component: D) -> ComponentId
    where
        D: Disposable + 'static,
    {
        let id = ComponentId(self.next_id());
        self.components.push((id, name.to_string(), Box::new(component)));
        id
    }

    pub fn dispose(&mut self, id: ComponentId) -> bool {
        match self.components.iter().position(|(c, _, _)| *c == id) {
            Some(index) => {
                let (_, name, mut component) = self.components.remove(index);
                component.dispose();
                trace!("Disposed component '{}' of {}", name, self.route);
                true
            }
            None => false,
        }
    }

    /// Disposes every owned component, newest first.
    pub fn dispose_all(&mut self) -> usize {
        let mut disposed = 0;
        while let Some((_, name, mut component)) = self.components.pop() {
            component.dispose();
            trace!("Disposed component '{}' of {}", name, self.route);
            disposed += 1;
        }
        disposed
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Tears down everything still registered: subscriptions (including any
    /// registered through a `ScopeHandle`), tasks and components, components in
    /// reverse order of ownership. Safe to call more than once.
    pub fn release_all(&mut self) -> ReleaseSummary {
        if self.released {
            return ReleaseSummary::default();
        }
        self.released = true;
        self.token.invalidate();

        let summary = ReleaseSummary {
            subscriptions: self.unsubscribe_all() + self.manager.unsubscribe_owner(&self.owner),
            tasks: self.cancel_all_tasks(),
            components: self.dispose_all(),
        };

        debug!(
            "Released scope of {}: {} subscription(s), {} task(s), {} component(s)",
            self.route, summary.subscriptions, summary.tasks, summary.components
        );
        summary
    }

    fn ensure_current(&self) -> Result<(), LinkError> {
        if self.released || !self.token.is_current() {
            return Err(LinkError::StaleActivation {
                route: self.route.to_string(),
            });
        }
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn spawn_tracked<Fut>(&mut self, work: Fut) -> TaskId
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = TaskId(self.next_id());
        self.tasks.retain(|(_, h)| !h.is_finished());
        self.tasks.push((id, tokio::spawn(work)));
        id
    }
}

impl Drop for PageScope {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Cloneable access to the connection layer for async work started by a page.
/// Every operation fails with `StaleActivation` once the activation is over.
#[derive(Debug, Clone)]
pub struct ScopeHandle {
    route: Route,
    owner: SubscriptionOwner,
    token: ActivationToken,
    manager: ConnectionManager,
}

impl ScopeHandle {
    pub fn is_current(&self) -> bool {
        self.token.is_current()
    }

    pub fn token(&self) -> &ActivationToken {
        &self.token
    }

    /// Subscribes on behalf of the activation. The scope removes it on release.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<Subscription, LinkError>
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.ensure_current()?;
        let token = self.token.clone();
        let sub = self.manager.subscribe_owned(&self.owner, topic, move |delivery| {
            if token.is_current() {
                callback(delivery);
            }
        })?;
        // Release may have run between the check and the insert.
        if !self.token.is_current() {
            self.manager.unsubscribe(&sub);
            return Err(self.stale());
        }
        Ok(sub)
    }

    pub fn publish(&self, topic: &str, data: Value) -> Result<(), LinkError> {
        self.ensure_current()?;
        self.manager.publish(topic, data)
    }

    /// A reply that lands after the activation ended is reported as stale.
    pub async fn request(&self, topic: &str, data: Value, timeout: Duration) -> Result<Value, LinkError> {
        self.ensure_current()?;
        let reply = self.manager.request(topic, data, timeout).await?;
        self.ensure_current()?;
        Ok(reply)
    }

    fn ensure_current(&self) -> Result<(), LinkError> {
        if self.token.is_current() {
            Ok(())
        } else {
            Err(self.stale())
        }
    }

    fn stale(&self) -> LinkError {
        LinkError::StaleActivation {
            route: self.route.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::core::ManagerOptions;
    use crate::transport::memory::MemoryBackend;
    use crate::transport::Endpoint;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    struct Counted(Arc<AtomicUsize>);

    impl Disposable for Counted {
        fn dispose(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(backend: &MemoryBackend) -> ConnectionManager {
        let mut options = ManagerOptions::new(Endpoint::parse("mem://backend/ws").unwrap());
        options.heartbeat_interval = None;
        ConnectionManager::start(options, Arc::new(backend.connector()), Arc::new(JsonCodec))
    }

    #[test]
    fn routes_are_normalised() {
        assert_eq!(Route::new("/logger/"), Route::new("logger"));
        assert_eq!(Route::new("/").as_str(), "");
        assert!(Route::new("").is_root());
        assert_eq!(Route::new("settings").path(), "/settings");
        assert_eq!(Route::from("/map").to_string(), "/map");
    }

    #[test]
    fn token_goes_stale_on_new_generation_or_invalidate() {
        let counter = Arc::new(AtomicU64::new(1));
        let token = ActivationToken::new(1, Arc::clone(&counter));
        assert!(token.is_current());
        counter.store(2, Ordering::SeqCst);
        assert!(!token.is_current());

        let token = ActivationToken::standalone();
        token.invalidate();
        assert!(!token.is_current());
    }

    #[tokio::test(start_paused = true)]
    async fn release_tears_down_everything_once() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let disposed = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(AtomicUsize::new(0));

        let mut scope = PageScope::new(Route::new("map"), ActivationToken::standalone(), manager.clone());
        scope.subscribe("gps.position", |_| {}).unwrap();
        scope.own("map", Counted(Arc::clone(&disposed)));
        let counter = Arc::clone(&ticks);
        scope.interval(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        let summary = scope.release_all();
        assert_eq!(summary.subscriptions, 1);
        assert_eq!(summary.components, 1);
        assert_eq!(summary.tasks, 1);
        assert_eq!(manager.subscription_count(), 0);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(scope.release_all().is_empty());
        drop(scope);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_scope_refuses_new_registrations() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let mut scope = PageScope::new(Route::new("logger"), ActivationToken::standalone(), manager.clone());
        let handle = scope.handle();
        scope.release_all();

        assert!(matches!(
            scope.subscribe("logs.app", |_| {}),
            Err(LinkError::StaleActivation { .. })
        ));
        assert!(matches!(
            handle.subscribe("logs.app", |_| {}),
            Err(LinkError::StaleActivation { .. })
        ));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_does_not_fire_after_release() {
        let backend = MemoryBackend::new();
        let manager = manager(&backend);
        let fired = Arc::new(AtomicUsize::new(0));
        let mut scope = PageScope::new(Route::new("settings"), ActivationToken::standalone(), manager);

        let counter = Arc::clone(&fired);
        scope.timeout(Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(100)).await;
        scope.release_all();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_interval_still_ticks() {
        let backend = MemoryBackend::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut scope = PageScope::new(Route::new("logger"), ActivationToken::standalone(), manager(&backend));

        let counter = Arc::clone(&ticks);
        scope.interval(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(10)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 5);
        assert_eq!(scope.release_all().tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scope_request_outlives_its_borrow() {
        let backend = MemoryBackend::new();
        backend.respond("settings.get", |_| Some(serde_json::json!({"units": "metric"})));
        let manager = manager(&backend);
        manager.get_or_create_channel(&Endpoint::parse("mem://backend/ws").unwrap()).unwrap();
        sleep(Duration::from_millis(5)).await;

        let scope = PageScope::new(Route::new("settings"), ActivationToken::standalone(), manager);
        let reply = scope.request("settings.get", Value::Null, Duration::from_secs(1));
        drop(scope);
        assert!(matches!(reply.await, Err(LinkError::StaleActivation { .. })));
    }
}
