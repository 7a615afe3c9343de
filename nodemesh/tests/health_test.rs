//! Health monitor driving node status and circuit breaker recovery.

mod common;

use axum::{extract::State, routing::post, Json, Router};
use common::{mesh_with, register, test_config, MockTransport};
use nodemesh::registry::HealthTransition;
use nodemesh::{CircuitState, HealthEvent, NodeStatus};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_breaker_opens_then_allows_one_trial_after_timeout() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 5;
    config.circuit_breaker.success_threshold = 1;
    config.circuit_breaker.retry_timeout_ms = 150;
    config.health.unhealthy_threshold = 3;
    config.health.auto_recover = true;
    let transport = MockTransport::new();
    let mesh = mesh_with(config, transport.clone());
    let id = register(&mesh, "alpha").await;
    let monitor = mesh.health_monitor();
    let mut events = monitor.subscribe();

    transport.set_ping("alpha", false);
    for _ in 0..5 {
        monitor.check_all().await;
    }
    assert_eq!(transport.ping_calls("alpha"), 5);
    assert_eq!(mesh.breaker().state(&id), CircuitState::Open);
    assert_eq!(mesh.registry().get(&id).unwrap().status, NodeStatus::Error);

    let event = events.try_recv().unwrap();
    assert_eq!(event.node_id, id);
    assert_eq!(event.transition, HealthTransition::BecameUnhealthy);

    // Open and not yet due: no ping at all
    let summary = monitor.check_all().await;
    assert_eq!(summary.skipped, 1);
    assert_eq!(transport.ping_calls("alpha"), 5);

    // Due: exactly one trial, whose failure reopens the breaker
    tokio::time::sleep(Duration::from_millis(200)).await;
    monitor.check_all().await;
    assert_eq!(transport.ping_calls("alpha"), 6);
    assert_eq!(mesh.breaker().state(&id), CircuitState::Open);
    monitor.check_all().await;
    assert_eq!(transport.ping_calls("alpha"), 6);

    // Node comes back: the next trial closes the breaker and reactivates it
    transport.set_ping("alpha", true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let summary = monitor.check_all().await;
    assert_eq!(summary.healthy, 1);
    assert_eq!(mesh.breaker().state(&id), CircuitState::Closed);
    assert_eq!(mesh.registry().get(&id).unwrap().status, NodeStatus::Active);
    assert_eq!(summary.events.len(), 1);
    assert_eq!(summary.events[0].transition, HealthTransition::Recovered);
}

#[tokio::test]
async fn test_auto_recover_off_leaves_breaker_open() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.retry_timeout_ms = 50;
    config.health.auto_recover = false;
    let transport = MockTransport::new();
    let mesh = mesh_with(config, transport.clone());
    let id = register(&mesh, "alpha").await;

    transport.set_ping("alpha", false);
    mesh.health_monitor().check_all().await;
    assert_eq!(mesh.breaker().state(&id), CircuitState::Open);

    transport.set_ping("alpha", true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = mesh.health_monitor().check_all().await;
    assert_eq!(summary.skipped, 1);
    assert_eq!(transport.ping_calls("alpha"), 1);

    mesh.reset_breaker(&id).unwrap();
    mesh.health_monitor().check_all().await;
    assert_eq!(transport.ping_calls("alpha"), 2);
}

#[tokio::test]
async fn test_retired_nodes_are_not_pinged() {
    let transport = MockTransport::new();
    let mesh = mesh_with(test_config(), transport.clone());
    let id = register(&mesh, "alpha").await;
    mesh.deactivate_node(&id).unwrap();

    let summary = mesh.health_monitor().check_all().await;
    assert_eq!(summary.checked, 0);
    assert_eq!(transport.ping_calls("alpha"), 0);
}

#[tokio::test]
async fn test_monitor_start_and_stop() {
    let mut config = test_config();
    config.health.interval_ms = 20;
    let transport = MockTransport::new();
    let mesh = mesh_with(config, transport.clone());
    register(&mesh, "alpha").await;

    let handle = mesh.start_health_monitor().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    mesh.health_monitor().stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(transport.ping_calls("alpha") >= 2);
    assert!(!mesh.health_monitor().is_running());
}

#[tokio::test]
async fn test_recovery_is_broadcast() {
    let mut config = test_config();
    config.health.unhealthy_threshold = 2;
    config.circuit_breaker.failure_threshold = 10;
    let transport = MockTransport::new();
    let mesh = mesh_with(config, transport.clone());
    let id = register(&mesh, "alpha").await;
    let monitor = mesh.health_monitor();
    let mut events = monitor.subscribe();

    transport.set_ping("alpha", false);
    monitor.check_all().await;
    assert!(events.try_recv().is_err());
    monitor.check_all().await;
    let down = events.try_recv().unwrap();
    assert_eq!(down.transition, HealthTransition::BecameUnhealthy);
    assert_eq!(down.consecutive_failures, 2);

    transport.set_ping("alpha", true);
    monitor.check_all().await;
    let up = events.try_recv().unwrap();
    assert_eq!(up.node_id, id);
    assert_eq!(up.node_name, "alpha");
    assert_eq!(up.transition, HealthTransition::Recovered);
    assert_eq!(up.consecutive_failures, 0);
    assert_eq!(mesh.registry().get(&id).unwrap().status, NodeStatus::Active);

    // Steady state emits nothing
    monitor.check_all().await;
    assert!(events.try_recv().is_err());
}

async fn receive_alert(
    State(tx): State<mpsc::UnboundedSender<HealthEvent>>,
    Json(event): Json<HealthEvent>,
) {
    let _ = tx.send(event);
}

#[tokio::test]
async fn test_transitions_are_posted_to_alert_webhook() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/alerts", post(receive_alert))
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = test_config();
    config.health.unhealthy_threshold = 1;
    config.health.alert_webhook_url = Some(format!("http://{}/alerts", addr));
    let transport = MockTransport::new();
    let mesh = mesh_with(config, transport.clone());
    let id = register(&mesh, "alpha").await;

    transport.set_ping("alpha", false);
    mesh.health_monitor().check_all().await;
    let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.node_id, id);
    assert_eq!(alert.transition, HealthTransition::BecameUnhealthy);

    transport.set_ping("alpha", true);
    mesh.health_monitor().check_all().await;
    let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.transition, HealthTransition::Recovered);
}
