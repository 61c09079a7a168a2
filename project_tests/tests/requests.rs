//! Request/response over reply inboxes.

use std::time::Duration;

use lib_link::LinkError;
use lib_link::transport::memory::MemoryBackend;
use project_tests::{endpoint, fast_options, settle, start_manager};
use serde_json::json;
use tokio::time::{Instant, sleep};

#[tokio::test(start_paused = true)]
async fn reply_resolves_the_request_once() {
    let backend = MemoryBackend::new();
    backend.respond("commands.compute_service", |data| {
        Some(json!({"accepted": true, "echo": data.clone()}))
    });
    let manager = start_manager(&backend, fast_options());
    manager.get_or_create_channel(&endpoint()).unwrap();
    settle().await;

    let reply = manager
        .request("commands.compute_service", json!({"command": "start"}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, json!({"accepted": true, "echo": {"command": "start"}}));
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn request_times_out_and_late_reply_is_discarded() {
    let backend = MemoryBackend::new();
    backend.respond_after("get_status", Duration::from_millis(1_500), |_| Some(json!({"status": "healthy"})));
    backend.respond("settings.get", |_| Some(json!({"units": "metric"})));
    let manager = start_manager(&backend, fast_options());
    manager.get_or_create_channel(&endpoint()).unwrap();
    settle().await;

    let started = Instant::now();
    let err = manager
        .request("get_status", json!({}), Duration::from_millis(1_000))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, LinkError::RequestTimeout { timeout_ms: 1_000, .. }));
    assert!(elapsed >= Duration::from_millis(1_000));
    assert!(elapsed < Duration::from_millis(1_200));
    assert_eq!(manager.pending_requests(), 0);

    // The reply lands at ~1500 ms and must not disturb anything.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(manager.pending_requests(), 0);
    let settings = manager
        .request("settings.get", json!({}), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(settings["units"], "metric");
}

#[tokio::test(start_paused = true)]
async fn request_without_open_channel_fails_fast() {
    let backend = MemoryBackend::new();
    backend.set_accepting(&endpoint(), false);
    let manager = start_manager(&backend, fast_options());

    let started = Instant::now();
    let err = manager
        .request("get_status", json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::ChannelNotReady { .. }));
    assert!(started.elapsed() < Duration::from_millis(10));
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_get_their_own_replies() {
    let backend = MemoryBackend::new();
    backend.respond("math.double", |data| data.as_i64().map(|n| json!(n * 2)));
    let manager = start_manager(&backend, fast_options());
    manager.get_or_create_channel(&endpoint()).unwrap();
    settle().await;

    let (a, b) = tokio::join!(
        manager.request("math.double", json!(2), Duration::from_secs(1)),
        manager.request("math.double", json!(21), Duration::from_secs(1)),
    );
    assert_eq!(a.unwrap(), json!(4));
    assert_eq!(b.unwrap(), json!(42));
}
