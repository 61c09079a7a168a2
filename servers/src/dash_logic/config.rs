use std::path::PathBuf;

use clap::Parser;
use lib_link::configs::{ConfigError, LinkConfig};

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Telemetry dashboard shell: page lifecycle over a resilient message channel", version)]
pub struct Cli {
    #[clap(long, env = "DASH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DASH_ENDPOINT", help = "Default backend endpoint (ws:// or wss://).")]
    pub endpoint: Option<String>,

    #[clap(long, env = "DASH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DASH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DASH_BASE_INTERVAL_MS", help = "Initial reconnect delay in milliseconds.")]
    pub base_interval_ms: Option<u64>,

    #[clap(long, env = "DASH_MAX_INTERVAL_MS", help = "Ceiling on the reconnect delay in milliseconds.")]
    pub max_interval_ms: Option<u64>,

    #[clap(long, env = "DASH_REQUEST_TIMEOUT_MS", help = "Default request timeout in milliseconds.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "DASH_DEFAULT_ROUTE", help = "Page shown for '/' and unknown routes.")]
    pub default_route: Option<String>,

    #[clap(long, env = "DASH_START_PATH", help = "Path to open on start.")]
    pub start_path: Option<String>,

    #[clap(long, help = "Run against the in-process simulator instead of a backend.")]
    pub offline: bool,
}

impl Cli {
    /// The command-line/environment layer of the configuration.
    pub fn overrides(&self) -> LinkConfig {
        LinkConfig {
            default_endpoint: self.endpoint.clone(),
            base_interval_ms: self.base_interval_ms,
            max_interval_ms: self.max_interval_ms,
            request_timeout_ms: self.request_timeout_ms,
            default_route: self.default_route.clone(),
            log_dir: self.log_dir.clone(),
            log_level: self.log_level.clone(),
            ..LinkConfig::default()
        }
    }
}

/// Defaults, then the config file (`dash_shell.conf` unless overridden), then
/// environment and command line.
pub fn load_config(cli: &Cli) -> Result<LinkConfig, ConfigError> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("dash_shell.conf"));
    LinkConfig::load_layered(Some(config_file_path.as_path()), cli.overrides())
}
