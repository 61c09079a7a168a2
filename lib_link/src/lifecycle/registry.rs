//! # Page Registry
//!
//! Explicit route to module table, fixed at registration time. An entry is
//! either a ready module or a deferred loader for code that is only fetched
//! when its route is first visited; a loaded module replaces its loader.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, info};

use crate::errors::LinkError;
use crate::lifecycle::page::{PageModule, Route};

pub type ModuleLoader =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn PageModule>, LinkError>> + Send + Sync>;

enum RegistryEntry {
    Ready(Arc<dyn PageModule>),
    Deferred(ModuleLoader),
}

pub struct PageRegistry {
    entries: HashMap<Route, RegistryEntry>,
    default_route: Route,
    error_route: Option<Route>,
}

impl fmt::Debug for PageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRegistry")
            .field("routes", &self.routes())
            .field("default_route", &self.default_route)
            .field("error_route", &self.error_route)
            .finish()
    }
}

impl PageRegistry {
    pub fn new(default_route: &str) -> Self {
        Self {
            entries: HashMap::new(),
            default_route: Route::new(default_route),
            error_route: None,
        }
    }

    /// Route shown when a deferred module fails to load or a module fails to init.
    pub fn with_error_route(mut self, route: &str) -> Self {
        self.error_route = Some(Route::new(route));
        self
    }

    pub fn register<M>(&mut self, route: &str, module: M) -> &mut Self
    where
        M: PageModule + 'static,
    {
        self.register_arc(route, Arc::new(module))
    }

    pub fn register_arc(&mut self, route: &str, module: Arc<dyn PageModule>) -> &mut Self {
        self.insert(Route::new(route), RegistryEntry::Ready(module));
        self
    }

    pub fn register_deferred<F, Fut>(&mut self, route: &str, loader: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn PageModule>, LinkError>> + Send + 'static,
    {
        let loader: ModuleLoader = Box::new(move || loader().boxed());
        self.insert(Route::new(route), RegistryEntry::Deferred(loader));
        self
    }

    fn insert(&mut self, route: Route, entry: RegistryEntry) {
        if self.entries.insert(route.clone(), entry).is_some() {
            info!("Replaced page module registered for {}", route);
        }
    }

    pub fn contains(&self, route: &Route) -> bool {
        self.entries.contains_key(route)
    }

    /// Registered routes, sorted.
    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.entries.keys().cloned().collect();
        routes.sort();
        routes
    }

    pub fn default_route(&self) -> &Route {
        &self.default_route
    }

    pub fn error_route(&self) -> Option<&Route> {
        self.error_route.as_ref()
    }

    pub fn is_loaded(&self, route: &Route) -> bool {
        matches!(self.entries.get(route), Some(RegistryEntry::Ready(_)))
    }

    /// Returns the module for `route`, running its loader on first use.
    pub async fn resolve(&mut self, route: &Route) -> Result<Arc<dyn PageModule>, LinkError> {
        let load = match self.entries.get(route) {
            None => {
                return Err(LinkError::RouteNotFound {
                    route: route.to_string(),
                })
            }
            Some(RegistryEntry::Ready(module)) => return Ok(Arc::clone(module)),
            Some(RegistryEntry::Deferred(loader)) => loader(),
        };

        debug!("Loading page module for {}", route);
        let module = load.await.map_err(|e| match e {
            LinkError::ModuleLoad { .. } => e,
            other => LinkError::ModuleLoad {
                route: route.to_string(),
                reason: other.to_string(),
            },
        })?;
        self.entries
            .insert(route.clone(), RegistryEntry::Ready(Arc::clone(&module)));
        info!("Loaded page module for {}", route);
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::page::PageScope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Blank;

    #[async_trait]
    impl PageModule for Blank {
        async fn init(&self, _scope: &mut PageScope) -> Result<(), LinkError> {
            Ok(())
        }

        fn cleanup(&self, _scope: &mut PageScope) {}
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let mut registry = PageRegistry::new("dashboard");
        registry.register("/dashboard/", Blank);
        assert!(registry.contains(&Route::new("dashboard")));
        assert!(matches!(
            registry.resolve(&Route::new("nowhere")).await,
            Err(LinkError::RouteNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deferred_module_loads_once_and_is_cached() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let mut registry = PageRegistry::new("dashboard");
        registry.register_deferred("twin", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Arc::new(Blank) as Arc<dyn PageModule>) }
        });

        let route = Route::new("twin");
        assert!(!registry.is_loaded(&route));
        registry.resolve(&route).await.unwrap();
        registry.resolve(&route).await.unwrap();
        assert!(registry.is_loaded(&route));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_failure_is_a_module_load_error() {
        let mut registry = PageRegistry::new("dashboard");
        registry.register_deferred("compute", || async {
            Err(LinkError::Transport("bundle missing".to_string()))
        });

        let err = registry.resolve(&Route::new("compute")).await.err().unwrap();
        assert!(matches!(err, LinkError::ModuleLoad { ref route, .. } if route == "/compute"));
        assert!(!registry.is_loaded(&Route::new("compute")));
    }
}
