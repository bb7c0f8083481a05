//! Integration tests for the REST and WebSocket surface

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use host_agent::{
    api::{ApiState, spawn_api_server},
    config::Config,
    context::AgentContext,
    ratelimit::RateLimit,
};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

use crate::helpers::*;

const TOKEN: &str = "test-token";

async fn spawn_test_api(mut config: Config) -> (SocketAddr, Arc<AgentContext>) {
    config.api.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.api.auth_token = Some(TOKEN.to_string());

    let host = Arc::new(FakeHost::default());
    let agent = start_agent(config, &host);
    let addr = spawn_api_server(agent.config.api.clone(), ApiState::new(agent.clone()))
        .await
        .unwrap();

    (addr, agent)
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
    let response = client()
        .get(format!("http://{addr}{path}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap_or(Value::Null))
}

async fn post(addr: SocketAddr, path: &str, body: Value) -> (StatusCode, Value) {
    let response = client()
        .post(format!("http://{addr}{path}"))
        .bearer_auth(TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap_or(Value::Null))
}

async fn delete(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
    let response = client()
        .delete(format!("http://{addr}{path}"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health_requires_token() {
    let (addr, agent) = spawn_test_api(test_config()).await;

    let response = client()
        .get(format!("http://{addr}/api/v1/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client()
        .get(format!("http://{addr}/api/v1/health"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let (status, body) = get(addr, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_operation_crud() {
    let (addr, agent) = spawn_test_api(test_config()).await;

    let (status, created) = post(
        addr,
        "/api/v1/operations",
        json!({ "type": "disk-scan", "parameters": { "devices": ["sda"] }, "description": "weekly scan" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["type"], "disk-scan");
    assert_eq!(created["status"], "running");
    assert_eq!(created["description"], "weekly scan");
    assert_eq!(created["cancellable"], true);
    assert!(created["started"].is_string());

    let id = created["id"].as_str().unwrap().to_string();

    let (status, snapshot) = get(addr, &format!("/api/v1/operations/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["id"], id.as_str());
    assert_eq!(snapshot["parameters"]["devices"][0], "sda");

    let (status, list) = get(addr, "/api/v1/operations?status=running&type=disk-scan").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    let (status, cancelled) = delete(addr, &format!("/api/v1/operations/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["cancel_requested"], true);

    let finished = wait_terminal(&agent.operations, &id).await;
    assert_eq!(finished.status.as_str(), "cancelled");

    let (status, again) = delete(addr, &format!("/api/v1/operations/{id}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(again["kind"], "OperationNotCancellable");

    let (status, stats) = get(addr, "/api/v1/operations/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["cancelled_total"], 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_operation_errors_map_to_status_codes() {
    let (addr, agent) = spawn_test_api(test_config()).await;

    let (status, body) = get(addr, "/api/v1/operations/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "OperationNotFound");

    let (status, body) = post(addr, "/api/v1/operations", json!({ "type": "defrag" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "UnknownOperationType");

    let (status, body) = post(
        addr,
        "/api/v1/operations",
        json!({ "type": "bulk-container", "parameters": { "containers": ["plex"] } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "ValidationFailed");

    let (_, list) = get(addr, "/api/v1/operations").await;
    assert_eq!(list["total"], 0);

    let (status, first) = post(addr, "/api/v1/operations", json!({ "type": "parity-check" })).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = post(addr, "/api/v1/operations", json!({ "type": "parity-check" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "OperationConflict");
    assert_eq!(body["details"]["conflicting_operation_id"], first["id"]);

    let (status, array) = post(addr, "/api/v1/operations", json!({ "type": "array-start" })).await;
    assert_eq!(status, StatusCode::CONFLICT, "{array}");

    let (status, body) = get(addr, "/api/v1/operations?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "InvalidRequest");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_class_rate_limit_returns_429() {
    let mut config = test_config();
    config
        .rate_limits
        .classes
        .insert(host_agent::ratelimit::OperationClass::BulkVm, RateLimit::new(1, 60));
    let (addr, agent) = spawn_test_api(config).await;

    let (status, _) = post(addr, "/api/v1/operations", json!({ "type": "bulk-vm" })).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = post(addr, "/api/v1/operations", json!({ "type": "bulk-vm" })).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["kind"], "RateLimitExceeded");
    assert_eq!(body["details"]["class"], "bulk_vm");

    let (status, stats) = get(addr, "/api/v1/rate-limits/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["classes"]["bulk_vm"]["denied"], 1);

    let (status, limits) = get(addr, "/api/v1/rate-limits/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(limits["bulk_vm"], json!({ "requests": 1, "window_secs": 60 }));
    assert_eq!(limits["system_power"], json!({ "requests": 3, "window_secs": 3600 }));

    agent.shutdown().await;
}

#[tokio::test]
async fn test_general_rate_limit_applies_to_every_request() {
    let mut config = test_config();
    config.rate_limits.general = RateLimit::new(3, 60);
    let (addr, agent) = spawn_test_api(config).await;

    for _ in 0..3 {
        let (status, _) = get(addr, "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = get(addr, "/api/v1/health").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["details"]["class"], "general");

    agent.shutdown().await;
}

#[tokio::test]
async fn test_threshold_update_is_validated() {
    let (addr, agent) = spawn_test_api(test_config()).await;

    let response = client()
        .put(format!("http://{addr}/api/v1/alerts/thresholds/disk"))
        .bearer_auth(TOKEN)
        .json(&json!({ "warning": 60, "critical": 50, "shutdown": 70 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "InvalidThresholds");

    let response = client()
        .put(format!("http://{addr}/api/v1/alerts/thresholds/disk"))
        .bearer_auth(TOKEN)
        .json(&json!({ "warning": 40, "critical": 50, "shutdown": 58, "auto_actions": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, thresholds) = get(addr, "/api/v1/alerts/thresholds").await;
    assert_eq!(thresholds["disk"]["critical"], 50.0);
    assert_eq!(thresholds["disk"]["auto_actions"], true);

    let response = client()
        .put(format!("http://{addr}/api/v1/alerts/thresholds/psu"))
        .bearer_auth(TOKEN)
        .json(&json!({ "warning": 40, "critical": 50, "shutdown": 58 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let (status, history) = get(addr, "/api/v1/alerts/history?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["count"], 0);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_monitoring_introspection() {
    let (addr, agent) = spawn_test_api(test_config()).await;

    let (status, intervals) = get(addr, "/api/v1/monitoring/intervals").await;
    assert_eq!(status, StatusCode::OK);
    assert!(intervals["channels"]["system_stats"]["current_ms"].as_u64().unwrap() >= 1000);

    let (status, reset) = post(addr, "/api/v1/monitoring/intervals/reset", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["load_factor"], 1.0);
    assert_eq!(reset["channels"]["storage_status"]["current_ms"], 30_000);

    let (status, connections) = get(addr, "/api/v1/monitoring/connections").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(connections["total_active"], 0);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_websocket_streams_frames() {
    let (addr, agent) = spawn_test_api(test_config()).await;

    let mut request = format!("ws://{addr}/api/v1/ws/system/stats")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {TOKEN}").parse().unwrap());

    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let frame: Value = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return serde_json::from_str(&text).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(frame["type"], "system_stats");
    assert_eq!(frame["data"]["host_name"], "test-host");
    assert!(frame["timestamp"].is_string());

    let (_, connections) = get(addr, "/api/v1/monitoring/connections").await;
    assert_eq!(connections["endpoints"]["system/stats"]["active"], 1);

    drop(socket);
    agent.shutdown().await;
}

#[tokio::test]
async fn test_websocket_unknown_endpoint_is_rejected() {
    let (addr, agent) = spawn_test_api(test_config()).await;

    let mut request = format!("ws://{addr}/api/v1/ws/nope")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {TOKEN}").parse().unwrap());

    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    agent.shutdown().await;
}
