//! # Health Probe
//!
//! Optional periodic request to a well-known status topic. The answer feeds
//! `GlobalStatus`: a healthy answer keeps it Online, anything else (including
//! no answer within the probe timeout) makes it Degraded. The probe never
//! makes the status Offline; only channel state does that.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::manager::ConnectionManager;
use crate::core::status::HealthReport;
use crate::errors::LinkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthProbeConfig {
    pub topic: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            topic: "get_status".to_string(),
            interval_ms: 15_000,
            timeout_ms: 3_000,
        }
    }
}

impl HealthProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Reads a probe reply. Accepts a bare string or bool, or an object with a
/// `status` (or `healthy`) field.
pub fn interpret(reply: &Value) -> HealthReport {
    let healthy = match reply {
        Value::Bool(ok) => *ok,
        Value::String(status) => is_healthy_word(status),
        Value::Object(map) => match (map.get("status"), map.get("healthy")) {
            (Some(Value::String(status)), _) => is_healthy_word(status),
            (_, Some(Value::Bool(ok))) => *ok,
            _ => false,
        },
        _ => false,
    };
    if healthy {
        HealthReport::Healthy
    } else {
        HealthReport::Degraded
    }
}

fn is_healthy_word(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "healthy" | "ok" | "online" | "running"
    )
}

/// Probe loop. Runs once per interval and additionally whenever `kick` fires
/// (the manager kicks it when a channel opens).
pub(crate) async fn run_probe(
    manager: ConnectionManager,
    config: HealthProbeConfig,
    kick: Arc<Notify>,
    cancel: CancellationToken,
) {
    debug!("Health probe started on '{}'", config.topic);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = kick.notified() => {}
            _ = tokio::time::sleep(config.interval()) => {}
        }

        if !manager.any_channel_open() {
            continue;
        }

        let report = match manager.request(&config.topic, json!({}), config.timeout()).await {
            Ok(reply) => interpret(&reply),
            Err(LinkError::RequestTimeout { .. }) => {
                warn!("Health probe on '{}' got no answer in {} ms", config.topic, config.timeout_ms);
                HealthReport::Degraded
            }
            Err(LinkError::Shutdown) => break,
            Err(e) => {
                debug!("Health probe skipped: {}", e);
                continue;
            }
        };
        manager.record_health(report);
    }
    debug!("Health probe on '{}' stopped", config.topic);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_shapes() {
        assert_eq!(interpret(&json!({"status": "healthy"})), HealthReport::Healthy);
        assert_eq!(interpret(&json!({"status": "OK"})), HealthReport::Healthy);
        assert_eq!(interpret(&json!({"healthy": true})), HealthReport::Healthy);
        assert_eq!(interpret(&json!("running")), HealthReport::Healthy);
        assert_eq!(interpret(&json!(true)), HealthReport::Healthy);

        assert_eq!(interpret(&json!({"status": "degraded"})), HealthReport::Degraded);
        assert_eq!(interpret(&json!({"healthy": false})), HealthReport::Degraded);
        assert_eq!(interpret(&json!({})), HealthReport::Degraded);
        assert_eq!(interpret(&Value::Null), HealthReport::Degraded);
    }

    #[test]
    fn config_reads_camel_case_with_defaults() {
        let config: HealthProbeConfig = serde_json::from_str(r#"{"topic":"system.status","timeoutMs":500}"#).unwrap();
        assert_eq!(config.topic, "system.status");
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.interval_ms, HealthProbeConfig::default().interval_ms);
    }
}
