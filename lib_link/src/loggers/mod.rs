//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber used by the binaries:
//!
//! - an `EnvFilter` taken from `RUST_LOG`, falling back to the configured level;
//! - a human-readable console layer with ANSI colours;
//! - a JSON layer written to a daily rotating file through a non-blocking
//!   `tracing-appender` writer.
//!
//! The returned `WorkerGuard` must be kept alive for as long as the process
//! logs; dropping it flushes and stops the file writer.

use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging(log_dir: &Path, file_prefix: &str, log_level: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    info!("Logging initialized with level: {} (files in {})", log_level, log_dir.display());
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_log_directory_and_refuses_second_install() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");

        let guard = setup_logging(&logs, "lib_link_test", "debug").unwrap();
        assert!(logs.is_dir());
        assert!(setup_logging(&logs, "lib_link_test", "debug").is_err());
        drop(guard);
    }
}
