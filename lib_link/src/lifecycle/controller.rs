//! # Page Lifecycle Controller
//!
//! Maps a route to exactly one active `PageModule` and swaps modules without
//! a reload.
//!
//! ## Transition
//! `navigate(route)` is a no-op when `route` is already active. Otherwise, with
//! transitions serialised behind the registry lock:
//!
//! 1. the outgoing activation token is invalidated, so nothing it registered
//!    fires again;
//! 2. the outgoing module's `cleanup` runs to completion;
//! 3. any subscription still owned by the outgoing activation is reported as a
//!    `SubscriptionLeak` (logged at error level) and the scope is released;
//! 4. the target module is resolved, loading it first if it is deferred;
//! 5. the new module's `init` runs against a fresh scope and token;
//! 6. it is recorded as active and the history is updated.
//!
//! A navigation to a different route does not wait for a pending load or
//! `init`: it invalidates the in-flight activation before queueing, the
//! superseded scope is retired and its navigation returns a report with
//! `superseded` set. Reads of the active route and history never wait on a
//! transition.
//!
//! Unknown routes fall back to the default route with a warning. A module that
//! fails to load or init is torn down and the error route, if registered, is
//! shown instead.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::ConnectionManager;
use crate::errors::LinkError;
use crate::lifecycle::history::{HistoryState, NavigationHistory};
use crate::lifecycle::page::{ActivationToken, PageModule, PageScope, ReleaseSummary, Route};
use crate::lifecycle::registry::PageRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    /// A new history entry.
    Push,
    /// Overwrite the current history entry (initial load).
    Replace,
    /// Back/forward: the history already points at the target.
    Pop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Activating(Route),
}

/// What one `navigate` call did.
#[derive(Debug)]
pub struct NavigationReport {
    pub requested: Route,
    pub active: Option<Route>,
    /// The target was already active; nothing ran.
    pub skipped: bool,
    /// A later navigation took over before this one finished.
    pub superseded: bool,
    pub cleaned_up: Option<Route>,
    pub released: ReleaseSummary,
    /// Set when the outgoing module left subscriptions behind.
    pub leak: Option<LinkError>,
    /// Set when the page shown is not the one requested.
    pub fallback: Option<LinkError>,
}

impl NavigationReport {
    fn new(requested: Route) -> Self {
        Self {
            requested,
            active: None,
            skipped: false,
            superseded: false,
            cleaned_up: None,
            released: ReleaseSummary::default(),
            leak: None,
            fallback: None,
        }
    }
}

struct ActivePage {
    route: Route,
    module: Arc<dyn PageModule>,
    scope: PageScope,
}

struct PageState {
    history: NavigationHistory,
    active: Option<ActivePage>,
}

/// The activation in flight plus the newest navigation request, shared by
/// callers that have not reached the registry lock yet.
#[derive(Default)]
struct PendingSlot {
    latest_ticket: u64,
    /// `None` for shutdown, which supersedes everything.
    latest_target: Option<Route>,
    activation: Option<(Route, ActivationToken)>,
}

enum Activation {
    Ready(ActivePage),
    Superseded,
}

pub struct PageLifecycleController {
    manager: ConnectionManager,
    /// Held for a whole transition, which serialises navigations.
    registry: tokio::sync::Mutex<PageRegistry>,
    routes: HashSet<Route>,
    default_route: Route,
    error_route: Option<Route>,
    pages: Mutex<PageState>,
    pending: Mutex<PendingSlot>,
    state: Mutex<ControllerState>,
    generation: Arc<AtomicU64>,
}

impl fmt::Debug for PageLifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLifecycleController")
            .field("state", &*self.state.lock())
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

/// Puts the controller back to Idle and clears the in-flight activation
/// however the transition ends.
struct TransitionGuard<'a>(&'a PageLifecycleController);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.0.pending.lock().activation = None;
        *self.0.state.lock() = ControllerState::Idle;
    }
}

impl PageLifecycleController {
    pub fn new(manager: ConnectionManager, registry: PageRegistry) -> Self {
        Self {
            manager,
            routes: registry.routes().into_iter().collect(),
            default_route: registry.default_route().clone(),
            error_route: registry.error_route().cloned(),
            registry: tokio::sync::Mutex::new(registry),
            pages: Mutex::new(PageState {
                history: NavigationHistory::new(),
                active: None,
            }),
            pending: Mutex::new(PendingSlot::default()),
            state: Mutex::new(ControllerState::Idle),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn state(&self) -> ControllerState {
        self.state.lock().clone()
    }

    /// Generation of the newest activation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn active_route(&self) -> Option<Route> {
        self.pages.lock().active.as_ref().map(|page| page.route.clone())
    }

    pub fn history(&self) -> Vec<HistoryState> {
        self.pages.lock().history.entries().to_vec()
    }

    pub fn current_entry(&self) -> Option<HistoryState> {
        self.pages.lock().history.current().cloned()
    }

    /// Initial load: "/" or "" shows the default route; the history entry is
    /// replaced rather than pushed.
    pub async fn start(&self, initial_path: &str) -> Result<NavigationReport, LinkError> {
        self.navigate_with(initial_path, NavigationKind::Replace).await
    }

    pub async fn navigate(&self, path: &str) -> Result<NavigationReport, LinkError> {
        self.navigate_with(path, NavigationKind::Push).await
    }

    pub async fn replace(&self, path: &str) -> Result<NavigationReport, LinkError> {
        self.navigate_with(path, NavigationKind::Replace).await
    }

    /// A popstate event. Without a usable state the current history path is used.
    pub async fn on_popstate(&self, state: Option<HistoryState>) -> Result<NavigationReport, LinkError> {
        let path = match state {
            Some(state) if !state.path.trim().is_empty() => state.path,
            _ => self
                .current_entry()
                .map(|entry| entry.path)
                .unwrap_or_else(|| self.default_route.path()),
        };
        self.navigate_with(&path, NavigationKind::Pop).await
    }

    /// Steps back in history. `None` when already at the oldest entry.
    pub async fn back(&self) -> Result<Option<NavigationReport>, LinkError> {
        let state = self.pages.lock().history.back();
        match state {
            Some(state) => self.on_popstate(Some(state)).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn forward(&self) -> Result<Option<NavigationReport>, LinkError> {
        let state = self.pages.lock().history.forward();
        match state {
            Some(state) => self.on_popstate(Some(state)).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn navigate_with(&self, path: &str, kind: NavigationKind) -> Result<NavigationReport, LinkError> {
        let requested = Route::new(path);
        let mut report = NavigationReport::new(requested.clone());

        let mut target = if requested.is_root() {
            self.default_route.clone()
        } else {
            requested.clone()
        };
        if !self.routes.contains(&target) {
            let missing = LinkError::RouteNotFound {
                route: target.to_string(),
            };
            if !self.routes.contains(&self.default_route) {
                error!(
                    "No page for {} and default route {} is not registered",
                    target, self.default_route
                );
                return Err(missing);
            }
            warn!("{}. Falling back to {}", missing, self.default_route);
            report.fallback = Some(missing);
            target = self.default_route.clone();
        }

        let ticket = self.supersede(Some(&target));
        let mut registry = self.registry.lock().await;

        if self.active_route().as_ref() == Some(&target) {
            debug!("{} already active. Navigation skipped", target);
            report.skipped = true;
            report.active = Some(target);
            return Ok(report);
        }

        let Some(token) = self.begin(ticket, &target, &target) else {
            debug!("Navigation to {} superseded before it started", target);
            report.superseded = true;
            return Ok(report);
        };
        *self.state.lock() = ControllerState::Activating(target.clone());
        let _transition = TransitionGuard(self);
        info!("Navigating to {} ({:?})", target, kind);

        let outgoing = self.pages.lock().active.take();
        if let Some(outgoing) = outgoing {
            report.cleaned_up = Some(outgoing.route.clone());
            let (leak, released) = self.retire(outgoing);
            report.leak = leak;
            report.released = released;
        }

        let page = match self.activate(&mut registry, &target, token).await {
            Ok(Activation::Ready(page)) => page,
            Ok(Activation::Superseded) => {
                report.superseded = true;
                return Ok(report);
            }
            Err(failure) => match self.error_route.clone() {
                Some(error_route) if error_route != target => {
                    error!("{}. Showing {}", failure, error_route);
                    let Some(token) = self.begin(ticket, &target, &error_route) else {
                        report.superseded = true;
                        return Ok(report);
                    };
                    report.fallback = Some(failure);
                    match self.activate(&mut registry, &error_route, token).await? {
                        Activation::Ready(page) => page,
                        Activation::Superseded => {
                            report.superseded = true;
                            return Ok(report);
                        }
                    }
                }
                _ => {
                    error!("{}", failure);
                    return Err(failure);
                }
            },
        };

        let route = page.route.clone();
        let mut pages = self.pages.lock();
        pages.active = Some(page);
        match kind {
            NavigationKind::Push => pages.history.push(&route),
            NavigationKind::Replace => pages.history.replace(&route),
            NavigationKind::Pop => {}
        }
        report.active = Some(route);
        Ok(report)
    }

    /// Cleans up the active module, if any, and leaves the controller empty.
    /// A pending activation is abandoned first.
    pub async fn shutdown(&self) -> Option<LinkError> {
        self.supersede(None);
        let _registry = self.registry.lock().await;
        let outgoing = self.pages.lock().active.take()?;
        let (leak, _) = self.retire(outgoing);
        leak
    }

    /// Records a navigation request and invalidates an in-flight activation
    /// for a different route. Returns the request's ticket.
    fn supersede(&self, target: Option<&Route>) -> u64 {
        let mut slot = self.pending.lock();
        slot.latest_ticket += 1;
        slot.latest_target = target.cloned();
        if let Some((route, token)) = &slot.activation {
            if target != Some(route) {
                debug!("Abandoning pending activation of {}", route);
                token.invalidate();
            }
        }
        slot.latest_ticket
    }

    /// Mints the token for activating `route` on behalf of the request for
    /// `target`, unless a later request for another route has arrived.
    fn begin(&self, ticket: u64, target: &Route, route: &Route) -> Option<ActivationToken> {
        let mut slot = self.pending.lock();
        if slot.latest_ticket != ticket && slot.latest_target.as_ref() != Some(target) {
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = ActivationToken::new(generation, Arc::clone(&self.generation));
        slot.activation = Some((target.clone(), token.clone()));
        Some(token)
    }

    /// Resolves and initialises `route`. Both steps give way as soon as the
    /// token goes stale.
    async fn activate(
        &self,
        registry: &mut PageRegistry,
        route: &Route,
        token: ActivationToken,
    ) -> Result<Activation, LinkError> {
        let Some(module) = until_stale(&token, registry.resolve(route)).await else {
            debug!("Loading {} abandoned", route);
            return Ok(Activation::Superseded);
        };
        let module = module?;

        let generation = token.generation();
        let mut scope = PageScope::new(route.clone(), token.clone(), self.manager.clone());
        let outcome = until_stale(&token, module.init(&mut scope)).await;

        let page = ActivePage {
            route: route.clone(),
            module,
            scope,
        };
        match outcome {
            Some(Ok(())) if token.is_current() => {
                debug!("{} active (generation {})", route, generation);
                Ok(Activation::Ready(page))
            }
            Some(Err(e)) if token.is_current() => {
                let _ = self.retire(page);
                Err(match e {
                    LinkError::ModuleInit { .. } => e,
                    other => LinkError::ModuleInit {
                        route: route.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
            _ => {
                info!("Activation of {} superseded (generation {})", route, generation);
                let _ = self.retire(page);
                Ok(Activation::Superseded)
            }
        }
    }

    fn retire(&self, page: ActivePage) -> (Option<LinkError>, ReleaseSummary) {
        let ActivePage {
            route,
            module,
            mut scope,
        } = page;

        scope.token().invalidate();
        module.cleanup(&mut scope);

        let leaked = self.manager.subscriptions_owned_by(scope.owner());
        let leak = if leaked.is_empty() {
            None
        } else {
            let leak = LinkError::SubscriptionLeak {
                route: route.to_string(),
                count: leaked.len(),
                topics: leaked.iter().map(|s| s.topic().to_string()).collect(),
            };
            error!("{}", leak);
            Some(leak)
        };

        let released = scope.release_all();
        debug!("{} cleaned up", route);
        (leak, released)
    }
}

/// Runs `work` until it finishes or `token` goes stale, whichever is first.
async fn until_stale<F: Future>(token: &ActivationToken, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.stale() => None,
        output = work => Some(output),
    }
}
