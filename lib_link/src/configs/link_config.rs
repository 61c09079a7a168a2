use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::{BackoffPolicy, HealthProbeConfig, ManagerOptions};
use crate::errors::LinkError;
use crate::transport::Endpoint;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] LinkError),
}

/// Every field is optional so that layers can be merged; `defaults()` fills
/// in the values used when no layer sets one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    pub default_endpoint: Option<String>,
    /// Topic prefix to endpoint URL.
    pub routes: Option<BTreeMap<String, String>>,
    pub base_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub jitter_ratio: Option<f64>,
    pub request_timeout_ms: Option<u64>,
    /// `0` disables the client heartbeat.
    pub heartbeat_interval_ms: Option<u64>,
    /// `0` disables the inactivity watchdog.
    pub inactivity_timeout_ms: Option<u64>,
    pub health: Option<HealthProbeConfig>,
    pub default_route: Option<String>,
    pub error_route: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl LinkConfig {
    pub fn defaults() -> Self {
        Self {
            default_endpoint: Some("ws://127.0.0.1:8000/ws".to_string()),
            routes: None,
            base_interval_ms: Some(1_000),
            max_interval_ms: Some(30_000),
            jitter_ratio: Some(0.2),
            request_timeout_ms: Some(5_000),
            heartbeat_interval_ms: Some(20_000),
            inactivity_timeout_ms: Some(0),
            health: None,
            default_route: Some("dashboard".to_string()),
            error_route: Some("error".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
        }
    }

    /// `other` wins for every field it sets.
    pub fn merge(self, other: LinkConfig) -> LinkConfig {
        LinkConfig {
            default_endpoint: other.default_endpoint.or(self.default_endpoint),
            routes: other.routes.or(self.routes),
            base_interval_ms: other.base_interval_ms.or(self.base_interval_ms),
            max_interval_ms: other.max_interval_ms.or(self.max_interval_ms),
            jitter_ratio: other.jitter_ratio.or(self.jitter_ratio),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            heartbeat_interval_ms: other.heartbeat_interval_ms.or(self.heartbeat_interval_ms),
            inactivity_timeout_ms: other.inactivity_timeout_ms.or(self.inactivity_timeout_ms),
            health: other.health.or(self.health),
            default_route: other.default_route.or(self.default_route),
            error_route: other.error_route.or(self.error_route),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then `file` if it exists, then `overrides`. A missing file is
    /// not an error; an unreadable or malformed one is.
    pub fn load_layered(file: Option<&Path>, overrides: LinkConfig) -> Result<Self, ConfigError> {
        let mut config = Self::defaults();

        match file {
            Some(path) if path.exists() => {
                config = config.merge(Self::from_json_file(path)?);
                info!("Loaded configuration from {}", path.display());
            }
            Some(path) => {
                info!(
                    "Config file not found at {}. Using defaults and environment/CLI values.",
                    path.display()
                );
            }
            None => {}
        }

        Ok(config.merge(overrides))
    }

    /// Builds manager options, validating every endpoint.
    pub fn manager_options(&self) -> Result<ManagerOptions, ConfigError> {
        let defaults = Self::defaults();
        let endpoint = self
            .default_endpoint
            .as_deref()
            .or(defaults.default_endpoint.as_deref())
            .unwrap_or_default();
        let mut options = ManagerOptions::new(Endpoint::parse(endpoint)?);

        for (prefix, url) in self.routes.iter().flatten() {
            options = options.with_route(prefix.clone(), Endpoint::parse(url)?);
        }

        let base = self.base_interval_ms.or(defaults.base_interval_ms).unwrap_or(1_000);
        let max = self.max_interval_ms.or(defaults.max_interval_ms).unwrap_or(30_000);
        if max < base {
            warn!("maxIntervalMs ({}) is below baseIntervalMs ({}); delays are capped at {}", max, base, max);
        }
        options.backoff = BackoffPolicy::new(base, max).with_jitter(self.jitter_ratio.unwrap_or(0.0));

        if let Some(ms) = self.request_timeout_ms {
            options.request_timeout = Duration::from_millis(ms);
        }
        options.heartbeat_interval = match self.heartbeat_interval_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => options.heartbeat_interval,
        };
        options.inactivity_timeout = self
            .inactivity_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        options.health = self.health.clone();

        Ok(options)
    }

    pub fn default_route(&self) -> &str {
        self.default_route.as_deref().unwrap_or("dashboard")
    }

    pub fn error_route(&self) -> &str {
        self.error_route.as_deref().unwrap_or("error")
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

impl fmt::Display for LinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LinkConfig
    Default endpoint: {:?},
    Routes: {:?},
    Backoff: {:?}..{:?} ms (jitter {:?}),
    Request timeout: {:?} ms,
    Heartbeat: {:?} ms,
    Inactivity timeout: {:?} ms,
    Health: {:?},
    Default route: {:?}, error route: {:?},
    Log: {:?} at {:?}
",
            self.default_endpoint,
            self.routes,
            self.base_interval_ms,
            self.max_interval_ms,
            self.jitter_ratio,
            self.request_timeout_ms,
            self.heartbeat_interval_ms,
            self.inactivity_timeout_ms,
            self.health,
            self.default_route,
            self.error_route,
            self.log_level,
            self.log_dir
        )
    }
}
