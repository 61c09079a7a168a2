//! Layered configuration driving a real manager.

use std::io::Write;
use std::sync::Arc;

use lib_link::configs::{ConfigError, LinkConfig};
use lib_link::transport::memory::MemoryBackend;
use lib_link::{ConnectionManager, Endpoint, JsonCodec};
use project_tests::settle;

#[tokio::test(start_paused = true)]
async fn file_routes_and_overrides_shape_the_manager() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{
            "defaultEndpoint": "mem://backend/ws",
            "routes": {{ "gps": "mem://backend/ws_gps" }},
            "baseIntervalMs": 250,
            "heartbeatIntervalMs": 0,
            "defaultRoute": "map"
        }}"#
    )?;
    let overrides = LinkConfig {
        base_interval_ms: Some(100),
        ..LinkConfig::default()
    };

    let config = LinkConfig::load_layered(Some(file.path()), overrides)?;
    assert_eq!(config.default_route(), "map");
    assert_eq!(config.error_route(), "error");

    let options = config.manager_options()?;
    assert_eq!(options.backoff.base_interval().as_millis(), 100);
    assert_eq!(options.heartbeat_interval, None);

    let backend = MemoryBackend::new();
    let manager = ConnectionManager::start(options, Arc::new(backend.connector()), Arc::new(JsonCodec));
    manager.subscribe("gps.position", |_| {})?;
    manager.subscribe("sensors.data", |_| {})?;
    settle().await;

    let gps = Endpoint::parse("mem://backend/ws_gps")?;
    let main = Endpoint::parse("mem://backend/ws")?;
    assert_eq!(backend.wire_subscriptions(&gps), vec!["gps.position"]);
    assert_eq!(backend.wire_subscriptions(&main), vec!["sensors.data"]);
    Ok(())
}

#[test]
fn bad_route_endpoint_is_rejected() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(file, r#"{{ "routes": {{ "gps": "tcp://10.0.0.5:9000" }} }}"#)?;

    let config = LinkConfig::load_layered(Some(file.path()), LinkConfig::default())?;
    assert!(matches!(config.manager_options(), Err(ConfigError::Invalid(_))));
    Ok(())
}
