//! Interactive driver for the page lifecycle controller, plus an offline
//! simulator that stands in for the backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lib_link::configs::LinkConfig;
use lib_link::lifecycle::{NavigationReport, PageLifecycleController};
use lib_link::transport::memory::MemoryBackend;
use lib_link::transport::ws::WsConnector;
use lib_link::{ConnectionManager, Connector, Endpoint, JsonCodec, ManagerOptions};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio_graceful::ShutdownGuard;
use tracing::{debug, error, info, warn};

use super::config::Cli;
use super::pages;

const SIMULATOR_ENDPOINT: &str = "mem://simulator/ws";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Go(String),
    Back,
    Forward,
    Status,
    Pub(String, Value),
    Req(String, Value),
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let topic_and_payload = |rest: &str| -> Result<(String, Value), String> {
            let (topic, payload) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if topic.is_empty() {
                return Err(format!("usage: {word} <topic> [json]"));
            }
            let data = match payload.trim() {
                "" => json!({}),
                raw => serde_json::from_str(raw).map_err(|e| format!("invalid json payload: {e}"))?,
            };
            Ok((topic.to_string(), data))
        };

        match word {
            "go" | "navigate" if !rest.is_empty() => Ok(Command::Go(rest.to_string())),
            "go" | "navigate" => Err("usage: go <route>".to_string()),
            "back" => Ok(Command::Back),
            "forward" => Ok(Command::Forward),
            "status" => Ok(Command::Status),
            "pub" => topic_and_payload(rest).map(|(t, d)| Command::Pub(t, d)),
            "req" => topic_and_payload(rest).map(|(t, d)| Command::Req(t, d)),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command '{other}', try 'help'")),
        }
    }
}

const HELP: &str = "commands: go <route> | back | forward | status | pub <topic> [json] | req <topic> [json] | quit";

fn log_report(report: &NavigationReport) {
    if report.skipped {
        info!("{} is already showing", report.requested);
        return;
    }
    if report.superseded {
        info!("navigation to {} was overtaken by a later one", report.requested);
        return;
    }
    if let Some(leak) = &report.leak {
        warn!("previous page leaked: {}", leak);
    }
    if let Some(fallback) = &report.fallback {
        warn!("showing fallback page: {}", fallback);
    }
    if let Some(active) = &report.active {
        info!("now showing {}", active);
    }
}

/// Seeds the in-memory broker with responders and starts feeding telemetry.
pub fn start_simulator(backend: &MemoryBackend, guard: &ShutdownGuard) {
    backend.respond("get_status", |_| {
        Some(json!({
            "status": "healthy",
            "services": {"sensors": "running", "gps": "running", "compute": "running"}
        }))
    });
    backend.respond("settings.get", |_| {
        Some(json!({"units": "metric", "refreshMs": 1000, "theme": "dark"}))
    });
    backend.respond("commands.compute_service", |data| {
        Some(json!({"accepted": true, "command": data.get("command").cloned().unwrap_or(Value::Null)}))
    });

    let backend = backend.clone();
    guard.spawn_task_fn(move |guard| async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = guard.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tick += 1;
            let (temp, lat, lon, load) = {
                let mut rng = rand::rng();
                (
                    rng.random_range(18.0..26.0_f64),
                    rng.random_range(59.30..59.35_f64),
                    rng.random_range(18.00..18.10_f64),
                    rng.random_range(0..100_u32),
                )
            };
            backend.publish("sensors.data", json!({"temperature": temp, "tick": tick}));
            backend.publish("gps.position", json!({"lat": lat, "lon": lon}));
            backend.publish("compute.status", json!({"load": load}));
            backend.publish("digital_twin.data", json!({"tick": tick, "pose": [lat, lon]}));
            if tick % 3 == 0 {
                backend.publish("logs.app", json!({"level": "info", "line": format!("tick {tick}")}));
            }
        }
        debug!("simulator stopped");
    });
}

/// Reads stdin on a detached thread so a pending read never holds up
/// runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// The shell task: builds the connection layer and the controller, then
/// drives navigation from stdin until quit or shutdown.
pub async fn run(config: LinkConfig, cli: Cli, quit: Arc<Notify>, guard: ShutdownGuard) {
    if let Err(e) = run_inner(config, cli, quit.clone(), guard).await {
        error!("shell stopped: {:#}", e);
        quit.notify_one();
    }
}

async fn run_inner(config: LinkConfig, cli: Cli, quit: Arc<Notify>, guard: ShutdownGuard) -> Result<()> {
    let mut options: ManagerOptions = config.manager_options().context("building connection options")?;

    let connector: Arc<dyn Connector> = if cli.offline {
        let backend = MemoryBackend::new();
        start_simulator(&backend, &guard);
        options.default_endpoint = Endpoint::parse(SIMULATOR_ENDPOINT)?;
        options.routes.clear();
        info!("offline mode: using the in-process simulator");
        Arc::new(backend.connector())
    } else {
        Arc::new(WsConnector::default())
    };

    let manager = ConnectionManager::start(options, connector, Arc::new(JsonCodec));
    let registry = pages::registry(config.default_route(), config.error_route());
    let controller = Arc::new(PageLifecycleController::new(manager.clone(), registry));

    let start_path = cli.start_path.clone().unwrap_or_else(|| "/".to_string());
    log_report(&controller.start(&start_path).await?);
    info!("{}", HELP);

    let mut lines = stdin_lines();
    loop {
        let line = tokio::select! {
            _ = guard.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            info!("stdin closed");
            quit.notify_one();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(msg) => {
                warn!("{}", msg);
                continue;
            }
        };

        match command {
            // Off the input loop. A later navigation overtakes a pending one.
            Command::Go(path) => {
                let controller = Arc::clone(&controller);
                guard.spawn_task_fn(move |_| async move {
                    match controller.navigate(&path).await {
                        Ok(report) => log_report(&report),
                        Err(e) => error!("navigation to {} failed: {}", path, e),
                    }
                });
            }
            Command::Back => {
                let controller = Arc::clone(&controller);
                guard.spawn_task_fn(move |_| async move {
                    match controller.back().await {
                        Ok(Some(report)) => log_report(&report),
                        Ok(None) => info!("no earlier page"),
                        Err(e) => error!("back failed: {}", e),
                    }
                });
            }
            Command::Forward => {
                let controller = Arc::clone(&controller);
                guard.spawn_task_fn(move |_| async move {
                    match controller.forward().await {
                        Ok(Some(report)) => log_report(&report),
                        Ok(None) => info!("no later page"),
                        Err(e) => error!("forward failed: {}", e),
                    }
                });
            }
            Command::Status => {
                let history: Vec<String> = controller.history().into_iter().map(|h| h.path).collect();
                info!(
                    "status: {} | page: {} | state: {:?} | subscriptions: {} | pending requests: {} | history: {:?}",
                    manager.status(),
                    controller
                        .active_route()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    controller.state(),
                    manager.subscription_count(),
                    manager.pending_requests(),
                    history
                );
            }
            Command::Pub(topic, data) => match manager.publish(&topic, data) {
                Ok(()) => info!("published to {}", topic),
                Err(e) => warn!("publish failed: {}", e),
            },
            Command::Req(topic, data) => match manager.request_default(&topic, data).await {
                Ok(reply) => info!("reply from {}: {}", topic, reply),
                Err(e) => warn!("request failed: {}", e),
            },
            Command::Help => info!("{}", HELP),
            Command::Quit => {
                quit.notify_one();
                break;
            }
        }
    }

    if let Some(leak) = controller.shutdown().await {
        warn!("last page leaked: {}", leak);
    }
    manager.shutdown();
    info!("shell closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_navigation_commands() {
        assert_eq!(Command::parse("go logger"), Ok(Command::Go("logger".to_string())));
        assert_eq!(Command::parse("  back "), Ok(Command::Back));
        assert_eq!(Command::parse("forward"), Ok(Command::Forward));
        assert!(Command::parse("go").is_err());
        assert!(Command::parse("jump map").is_err());
    }

    #[test]
    fn parses_publish_and_request_payloads() {
        assert_eq!(
            Command::parse(r#"pub commands.compute_service {"command":"start"}"#),
            Ok(Command::Pub(
                "commands.compute_service".to_string(),
                json!({"command": "start"})
            ))
        );
        assert_eq!(
            Command::parse("req get_status"),
            Ok(Command::Req("get_status".to_string(), json!({})))
        );
        assert!(Command::parse("pub sensors.data {broken").is_err());
        assert!(Command::parse("req").is_err());
    }
}
