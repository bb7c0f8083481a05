//! Operation registry behaviour through a fully wired agent

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use host_agent::operations::{
    OperationError, OperationFilter, OperationRequest, OperationStatus, OperationType, Parameters,
};
use host_agent::ratelimit::{OperationClass, RateLimit};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use crate::helpers::*;

fn params(value: Value) -> Parameters {
    match value {
        Value::Object(map) => map,
        _ => Parameters::new(),
    }
}

#[tokio::test]
async fn test_second_parity_check_conflicts_until_first_is_cancelled() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let manager = &agent.operations;

    let first = manager
        .start_operation(
            OperationRequest::new(OperationType::ParityCheck, params(json!({"correct": false}))),
            "10.0.0.1",
        )
        .unwrap();
    assert_eq!(first.status, OperationStatus::Running);

    let err = manager
        .start_operation(
            OperationRequest::new(OperationType::ArrayStop, Parameters::new()),
            "10.0.0.2",
        )
        .unwrap_err();
    assert_matches!(
        err,
        OperationError::OperationConflict { ref conflicting_id, conflicting_type: OperationType::ParityCheck }
            if *conflicting_id == first.id
    );

    let cancelled = manager.cancel_operation(&first.id).unwrap();
    assert!(cancelled.cancel_requested);
    let finished = wait_terminal(manager, &first.id).await;
    assert_eq!(finished.status, OperationStatus::Cancelled);

    let retry = manager
        .start_operation(
            OperationRequest::new(OperationType::ArrayStop, Parameters::new()),
            "10.0.0.2",
        )
        .unwrap();
    let done = wait_terminal(manager, &retry.id).await;
    assert_eq!(done.status, OperationStatus::Completed);
    assert_eq!(done.progress, Some(100));

    agent.shutdown().await;
}

#[tokio::test]
async fn test_invalid_submission_is_not_persisted() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let manager = &agent.operations;

    let err = manager
        .start_operation(
            OperationRequest::new(OperationType::BulkContainer, params(json!({"containers": ["a"]}))),
            "10.0.0.1",
        )
        .unwrap_err();

    assert_matches!(err, OperationError::ValidationFailed(_));
    assert_eq!(manager.list_operations(&OperationFilter::default()).total, 0);
    assert_eq!(manager.get_stats().started_total, 0);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_class_limit_is_per_client() {
    let host = Arc::new(FakeHost::default());
    let mut config = test_config();
    config
        .rate_limits
        .classes
        .insert(OperationClass::BulkVm, RateLimit::new(2, 60));
    let agent = start_agent(config, &host);
    let manager = &agent.operations;

    let submit = |client: &str| {
        manager.start_operation(
            OperationRequest::new(OperationType::BulkVm, params(json!({"vms": ["win11"]}))),
            client,
        )
    };

    assert!(submit("10.0.0.1").is_ok());
    assert!(submit("10.0.0.1").is_ok());
    assert_matches!(
        submit("10.0.0.1"),
        Err(OperationError::RateLimitExceeded {
            class: OperationClass::BulkVm,
            ..
        })
    );
    assert!(submit("10.0.0.2").is_ok());

    let stats = agent.limiter.stats();
    assert_eq!(stats.classes[&OperationClass::BulkVm].denied, 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_max_operations_bound() {
    let host = Arc::new(FakeHost::default());
    let mut config = test_config();
    config.operations.max_concurrent = 2;
    let agent = start_agent(config, &host);
    let manager = &agent.operations;

    for _ in 0..2 {
        manager
            .start_operation(
                OperationRequest::new(OperationType::DiskScan, params(json!({"devices": ["sda"]}))),
                "10.0.0.1",
            )
            .unwrap();
    }

    assert_matches!(
        manager.start_operation(
            OperationRequest::new(OperationType::DiskScan, params(json!({"devices": ["sdb"]}))),
            "10.0.0.1",
        ),
        Err(OperationError::MaxOperationsReached { limit: 2 })
    );

    agent.shutdown().await;
}

#[tokio::test]
async fn test_list_filters_by_status_and_type() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let manager = &agent.operations;

    let scan = manager
        .start_operation(
            OperationRequest::new(OperationType::DiskScan, Parameters::new()),
            "10.0.0.1",
        )
        .unwrap();
    let vm = manager
        .start_operation(
            OperationRequest::new(OperationType::BulkVm, Parameters::new()),
            "10.0.0.1",
        )
        .unwrap();
    wait_terminal(manager, &vm.id).await;

    let running = manager.list_operations(&OperationFilter {
        status: Some(OperationStatus::Running),
        ..Default::default()
    });
    assert_eq!(running.total, 1);
    assert_eq!(running.items[0].id, scan.id);

    let vms = manager.list_operations(&OperationFilter {
        op_type: Some(OperationType::BulkVm),
        ..Default::default()
    });
    assert_eq!(vms.items.len(), 1);
    assert_eq!(vms.items[0].status, OperationStatus::Completed);

    assert_eq!(manager.list_operations(&OperationFilter::default()).total, 2);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_operations() {
    let host = Arc::new(FakeHost::default());
    let agent = start_agent(test_config(), &host);
    let manager = agent.operations.clone();

    let scan = manager
        .start_operation(
            OperationRequest::new(OperationType::DiskScan, Parameters::new()),
            "10.0.0.1",
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), agent.shutdown())
        .await
        .unwrap();

    let operation = manager.get_operation(&scan.id).unwrap();
    assert_eq!(operation.status, OperationStatus::Cancelled);
    assert!(operation.completed.is_some());
}
