//! # Dashboard Shell
//!
//! Runs the page lifecycle controller over the resilient connection layer
//! and lets an operator drive navigation from stdin:
//!
//! - **Configuration**: defaults, then `dash_shell.conf` (JSON), then `DASH_*`
//!   environment variables and command-line flags.
//! - **Logging**: console plus daily rotating JSON files through `tracing`.
//! - **Graceful Shutdown**: `tokio-graceful` stops the shell on Ctrl+C,
//!   SIGTERM, `quit` or end of input, with a 10 second limit.
//! - **Offline mode**: `--offline` swaps the WebSocket backend for an
//!   in-process simulator publishing synthetic telemetry.

mod dash_logic;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Notify;
use tokio_graceful::Shutdown;
use tracing::{error, info};

use dash_logic::config::{load_config, Cli};
use dash_logic::shell;
use lib_link::loggers::setup_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // .env first, then the platform specific file
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match setup_logging(&config.log_dir(), "dash_shell", config.log_level()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    info!("{}", config);

    let quit = Arc::new(Notify::new());
    let quit_signal = Arc::clone(&quit);
    let shutdown = Shutdown::new(async move {
        tokio::select! {
            _ = tokio_graceful::default_signal() => {}
            _ = quit_signal.notified() => {}
        }
    });

    shutdown.spawn_task_fn(move |guard| shell::run(config, cli, quit, guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            error!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}
