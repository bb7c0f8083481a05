//! Live telemetry through the broadcast hub of a running agent

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use host_agent::TemperatureReading;
use host_agent::adaptive::MonitorChannel;
use host_agent::alerts::{AlertThreshold, SensorClass};
use host_agent::hub::{Frame, Subscription};
use host_agent::operations::{
    OperationFilter, OperationRequest, OperationStatus, OperationType, Parameters,
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

/// Receive frames until one of `frame_type` arrives
async fn next_frame(sub: &mut Subscription, frame_type: &str) -> Arc<Frame> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = sub.frames.recv().await.expect("subscription closed");
            if frame.frame_type == frame_type {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {frame_type} frame received"))
}

#[tokio::test]
async fn test_late_subscriber_starts_from_cached_snapshot() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);

    let mut early = agent.registry().register("system/stats");
    let first = next_frame(&mut early, "system_stats").await;
    assert_eq!(first.data["host_name"], "test-host");

    let mut late = agent.registry().register("system/stats");
    let cached = tokio::time::timeout(Duration::from_millis(100), late.frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.frame_type, "system_stats");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_container_state_change_is_published_as_event() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let mut sub = agent.registry().register("docker/events");

    let snapshot = next_frame(&mut sub, "containers").await;
    assert_eq!(snapshot.data[0]["name"], "plex");

    *host.containers.lock().unwrap() = vec![
        container("c1", "plex", "exited"),
        container("c2", "sonarr", "running"),
    ];

    let poller = agent.hub.poller(MonitorChannel::DockerEvents).unwrap();
    assert_eq!(poller.poll_now().await.unwrap(), 2);

    let changed = next_frame(&mut sub, "container_event").await;
    assert_eq!(changed.data["kind"], "changed");
    assert_eq!(changed.data["before"]["state"], "running");
    assert_eq!(changed.data["after"]["state"], "exited");

    let added = next_frame(&mut sub, "container_event").await;
    assert_eq!(added.data["kind"], "added");
    assert_eq!(added.data["key"], "c2");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_collector_failure_degrades_to_error_frame() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let mut sub = agent.registry().register("system/stats");
    next_frame(&mut sub, "system_stats").await;

    host.fail_system.store(true, Ordering::SeqCst);
    let poller = agent.hub.poller(MonitorChannel::SystemStats).unwrap();
    assert!(poller.poll_now().await.is_err());

    let error = next_frame(&mut sub, "error").await;
    assert_eq!(error.data["channel"], "system_stats");
    assert!(error.data["error"].as_str().unwrap().contains("collector offline"));

    let stats = agent.controller.stats();
    let channel = &stats.channels[&MonitorChannel::SystemStats];
    assert!(channel.errors >= 1);
    assert!(channel.last_error.as_deref().unwrap().contains("collector offline"));

    agent.shutdown().await;
}

#[tokio::test]
async fn test_operation_updates_reach_operations_endpoint() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let mut sub = agent.registry().register("operations");

    let operation = agent
        .operations
        .start_operation(
            OperationRequest::new(OperationType::ArrayStart, Parameters::new()),
            "10.0.0.1",
        )
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = next_frame(&mut sub, "operation_update").await;
            if frame.data["status"] == "completed" {
                return frame;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(completed.data["id"], operation.id.as_str());
    assert_eq!(completed.data["type"], "array-start");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_critical_temperature_throttles_containers() {
    let host = Arc::new(FakeHost::default());
    *host.temperatures.lock().unwrap() = vec![TemperatureReading {
        sensor: "CPU Temp".to_string(),
        celsius: 85.0,
        critical: None,
    }];

    let mut config = test_config();
    config.alerts.thresholds.insert(
        SensorClass::Cpu,
        AlertThreshold::new(70.0, 80.0, 90.0).with_auto_actions(true),
    );
    config.alerts.throttle_containers = vec!["plex".to_string()];

    let agent = start_agent(config, &host);
    let mut sub = agent.registry().register("alerts/resources");

    let alert = next_frame(&mut sub, "alert").await;
    assert_eq!(alert.data["level"], "critical");
    assert_eq!(alert.data["class"], "cpu");
    assert!(
        alert.data["action"]
            .as_str()
            .unwrap()
            .starts_with("submitted bulk-container")
    );

    let throttles = agent.operations.list_operations(&OperationFilter {
        op_type: Some(OperationType::BulkContainer),
        ..Default::default()
    });
    assert!(throttles.total >= 1);
    assert_eq!(throttles.items[0].parameters["action"], "pause");
    assert_eq!(throttles.items[0].created_by, "alert-engine");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped() {
    let host = Arc::new(FakeHost::default());
    let mut config = test_config();
    config.monitoring.subscriber_queue = 1;
    let agent = start_agent(config, &host);

    let stalled = agent.registry().register("infrastructure");
    let poller = agent.hub.poller(MonitorChannel::Infrastructure).unwrap();

    for _ in 0..3 {
        let _ = poller.poll_now().await;
    }

    assert!(stalled.closed.is_cancelled());
    assert_eq!(agent.registry().connection_count("infrastructure"), 0);
    assert!(agent.registry().stats().endpoints["infrastructure"].overflow_drops >= 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_subscribers() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let sub = agent.registry().register("vm/events");

    agent.shutdown().await;

    assert!(sub.closed.is_cancelled());
    assert!(agent.hub.poller(MonitorChannel::VmEvents).unwrap().poll_now().await.is_err());
    assert_eq!(
        agent
            .operations
            .list_operations(&OperationFilter {
                status: Some(OperationStatus::Running),
                ..Default::default()
            })
            .total,
        0
    );
}
