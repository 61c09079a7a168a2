//! Dashboard page modules. Rendering is opaque to the connection layer, so
//! every view here is a `Panel` that writes what it would draw to the log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lib_link::lifecycle::{Disposable, PageModule, PageRegistry, PageScope};
use lib_link::{GlobalStatus, LinkError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const PANEL_ROWS: usize = 50;

struct PanelState {
    title: String,
    rows: VecDeque<String>,
    disposed: bool,
}

/// Cloneable drawing handle for a panel owned by a page scope.
#[derive(Clone)]
pub struct PanelHandle(Arc<Mutex<PanelState>>);

impl PanelHandle {
    pub fn render(&self, line: impl Into<String>) {
        let mut state = self.0.lock();
        if state.disposed {
            warn!("[{}] render after dispose ignored", state.title);
            return;
        }
        let line = line.into();
        info!(target: "view", "[{}] {}", state.title, line);
        if state.rows.len() == PANEL_ROWS {
            state.rows.pop_front();
        }
        state.rows.push_back(line);
    }

    #[cfg(test)]
    fn rows(&self) -> Vec<String> {
        self.0.lock().rows.iter().cloned().collect()
    }

    #[cfg(test)]
    fn is_disposed(&self) -> bool {
        self.0.lock().disposed
    }
}

/// The owned side of a panel.
pub struct Panel(PanelHandle);

impl Panel {
    pub fn new(title: &str) -> (Panel, PanelHandle) {
        let handle = PanelHandle(Arc::new(Mutex::new(PanelState {
            title: title.to_string(),
            rows: VecDeque::new(),
            disposed: false,
        })));
        (Panel(handle.clone()), handle)
    }
}

impl Disposable for Panel {
    fn dispose(&mut self) {
        let mut state = self.0 .0.lock();
        state.disposed = true;
        state.rows.clear();
        debug!(target: "view", "[{}] disposed", state.title);
    }
}

fn summarize(data: &Value) -> String {
    let text = data.to_string();
    if text.chars().count() > 120 {
        format!("{}...", text.chars().take(120).collect::<String>())
    } else {
        text
    }
}

/// Overview: connectivity indicator, service states and an initial snapshot.
pub struct DashboardPage;

#[async_trait]
impl PageModule for DashboardPage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (panel, view) = Panel::new("dashboard");
        scope.own("status panel", panel);

        let status_view = view.clone();
        scope.on_status(move |status| {
            let label = match status {
                GlobalStatus::Online => "ONLINE",
                GlobalStatus::Degraded => "DEGRADED",
                GlobalStatus::Offline => "OFFLINE",
            };
            status_view.render(format!("connection: {label}"));
        });

        let services_view = view.clone();
        scope.subscribe("compute.status", move |msg| {
            services_view.render(format!("compute: {}", summarize(&msg.data)));
        })?;

        let handle = scope.handle();
        scope.spawn(async move {
            match handle.request("get_status", json!({}), Duration::from_secs(3)).await {
                Ok(snapshot) => view.render(format!("services: {}", summarize(&snapshot))),
                Err(LinkError::StaleActivation { .. }) => {}
                Err(e) => view.render(format!("services unavailable: {e}")),
            }
        });
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.unsubscribe_all();
        scope.cancel_all_tasks();
        scope.dispose_all();
    }
}

pub struct SensorsPage;

#[async_trait]
impl PageModule for SensorsPage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (panel, view) = Panel::new("sensors");
        scope.own("sensor table", panel);
        scope.subscribe("sensors.data", move |msg| view.render(summarize(&msg.data)))?;
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.unsubscribe_all();
        scope.dispose_all();
    }
}

/// Live log tail with a periodic line counter.
pub struct LoggerPage;

#[async_trait]
impl PageModule for LoggerPage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (panel, view) = Panel::new("logger");
        scope.own("log table", panel);

        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let tail = view.clone();
        scope.subscribe("logs.>", move |msg| {
            counter.fetch_add(1, Ordering::Relaxed);
            tail.render(format!("{} {}", msg.topic, summarize(&msg.data)));
        })?;

        scope.interval(Duration::from_secs(10), move || {
            view.render(format!("{} line(s) received", received.load(Ordering::Relaxed)));
        });
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.unsubscribe_all();
        scope.cancel_all_tasks();
        scope.dispose_all();
    }
}

pub struct MapPage;

#[async_trait]
impl PageModule for MapPage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (map, view) = Panel::new("map");
        scope.own("map", map);
        scope.subscribe("gps.position", move |msg| {
            let lat = msg.data.get("lat").and_then(Value::as_f64);
            let lon = msg.data.get("lon").and_then(Value::as_f64);
            match (lat, lon) {
                (Some(lat), Some(lon)) => view.render(format!("marker at {lat:.5}, {lon:.5}")),
                _ => view.render(format!("unreadable fix: {}", summarize(&msg.data))),
            }
        })?;
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.unsubscribe_all();
        scope.dispose_all();
    }
}

/// Loads the current settings once; renders its own error state on failure.
pub struct SettingsPage;

#[async_trait]
impl PageModule for SettingsPage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (panel, view) = Panel::new("settings");
        scope.own("settings form", panel);

        let handle = scope.handle();
        scope.spawn(async move {
            match handle.request("settings.get", json!({}), Duration::from_secs(3)).await {
                Ok(settings) => view.render(summarize(&settings)),
                Err(LinkError::StaleActivation { .. }) => {}
                Err(e) => view.render(format!("could not load settings: {e}")),
            }
        });
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.cancel_all_tasks();
        scope.dispose_all();
    }
}

/// Compute service view: live load plus the service's answer to a status
/// command sent on entry.
pub struct ComputePage;

#[async_trait]
impl PageModule for ComputePage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (panel, view) = Panel::new("compute");
        scope.own("compute panel", panel);

        let load_view = view.clone();
        scope.subscribe("compute.status", move |msg| {
            match msg.data.get("load").and_then(Value::as_u64) {
                Some(load) => load_view.render(format!("load {load}%")),
                None => load_view.render(summarize(&msg.data)),
            }
        })?;

        let handle = scope.handle();
        scope.spawn(async move {
            let command = json!({"command": "status"});
            match handle.request("commands.compute_service", command, Duration::from_secs(3)).await {
                Ok(reply) => view.render(format!("service: {}", summarize(&reply))),
                Err(LinkError::StaleActivation { .. }) => {}
                Err(e) => view.render(format!("service did not answer: {e}")),
            }
        });
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.unsubscribe_all();
        scope.cancel_all_tasks();
        scope.dispose_all();
    }
}

/// Digital twin view. Registered as a deferred module.
pub struct TwinPage;

#[async_trait]
impl PageModule for TwinPage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (panel, view) = Panel::new("digital twin");
        scope.own("twin scene", panel);
        scope.subscribe("digital_twin.data", move |msg| view.render(summarize(&msg.data)))?;
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.unsubscribe_all();
        scope.dispose_all();
    }
}

pub struct ErrorPage;

#[async_trait]
impl PageModule for ErrorPage {
    async fn init(&self, scope: &mut PageScope) -> Result<(), LinkError> {
        let (panel, view) = Panel::new("error");
        view.render("This page could not be loaded. Pick another page.");
        scope.own("error notice", panel);
        Ok(())
    }

    fn cleanup(&self, scope: &mut PageScope) {
        scope.dispose_all();
    }
}

/// The shell's route table.
pub fn registry(default_route: &str, error_route: &str) -> PageRegistry {
    let mut registry = PageRegistry::new(default_route).with_error_route(error_route);
    registry
        .register("dashboard", DashboardPage)
        .register("sensors", SensorsPage)
        .register("logger", LoggerPage)
        .register("map", MapPage)
        .register("settings", SettingsPage)
        .register("compute", ComputePage)
        .register(error_route, ErrorPage)
        .register_deferred("twin", || async {
            Ok(Arc::new(TwinPage) as Arc<dyn PageModule>)
        });
    registry
}
