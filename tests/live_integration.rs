//! Integration tests against a live broker and Docker daemon.
//!
//! These tests need a local Redis and Docker.
//! Run with: GAIA_TEST_REDIS_URL=redis://localhost:6379 cargo test --test live_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use gaia::execution::{DockerClient, DockerRuntime, LifecycleManager, WorkerRole, WorkerSpec};
use gaia::pipeline::{PipelineRequest, RequestStatus, Stage, StatusMap};
use gaia::scheduler::{RedisTaskQueue, TaskEnvelope, TaskQueue};

fn redis_url() -> String {
    std::env::var("GAIA_TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_namespace() -> String {
    format!("gaia-test-{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test live_integration -- --ignored
async fn test_publish_claim_and_depth() {
    let queue = RedisTaskQueue::connect(&redis_url(), &test_namespace())
        .await
        .expect("Redis should be reachable");

    assert!(queue.sample_depth(Stage::Llm).await.is_err(), "undeclared queue must not be created");

    queue.declare_queues(false).await.expect("declare should succeed");
    assert_eq!(queue.sample_depth(Stage::Llm).await.unwrap(), 0);

    let envelope = TaskEnvelope::new("req-live", Stage::Llm, json!({"queries": ["q"]}));
    let handle = queue.publish(Stage::Llm, &envelope).await.unwrap();
    assert_eq!(queue.sample_depth(Stage::Llm).await.unwrap(), 1);

    assert!(queue.claim(&handle).await.unwrap());
    assert!(!queue.claim(&handle).await.unwrap(), "a message is claimed once");
    assert_eq!(queue.sample_depth(Stage::Llm).await.unwrap(), 0);

    let reply = queue
        .await_reply(&handle, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(reply.is_none());
}

#[tokio::test]
#[ignore]
async fn test_request_inbox_round_trip() {
    let queue = RedisTaskQueue::connect(&redis_url(), &test_namespace())
        .await
        .expect("Redis should be reachable");

    let request = PipelineRequest::new("req-inbox", "legal", "s3://docs");
    queue.enqueue_request(&request).await.unwrap();

    let received = queue
        .dequeue_request(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("request should be waiting");
    assert_eq!(received.id, "req-inbox");
    assert_eq!(received.docs_source, "s3://docs");

    // Polling an empty inbox reuses the same blocking connection.
    assert!(queue.dequeue_request(Duration::from_secs(1)).await.unwrap().is_none());
    assert_eq!(queue.idle_blocking_connections(), 1);

    assert!(queue.fetch_status("req-inbox").await.unwrap().is_none());
    let status = StatusMap {
        request_id: "req-inbox".to_string(),
        status: RequestStatus::Completed,
        stages: Default::default(),
    };
    queue.store_status(&status).await.unwrap();
    assert_eq!(queue.fetch_status("req-inbox").await.unwrap(), Some(status));
}

#[tokio::test]
#[ignore]
async fn test_task_worker_output_is_captured() {
    let client = DockerClient::new().expect("Docker should be reachable");
    let lifecycle = LifecycleManager::new(Arc::new(DockerRuntime::new(client)));

    let spec = WorkerSpec::new(Stage::Chunker, "alpine:3.19", WorkerRole::Task(Uuid::new_v4()))
        .with_command(Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo \"$INPUT_DATA\"".to_string(),
        ]))
        .with_env("INPUT_DATA", r#"{"chunks": 1}"#);

    let manager = lifecycle.clone();
    let output = lifecycle
        .scoped(spec, |handle| async move { manager.wait(&handle).await })
        .await
        .expect("worker should start")
        .expect("worker should exit cleanly");

    assert_eq!(output.exit_code, 0);
    assert!(output.logs.contains(r#"{"chunks": 1}"#));
    assert_eq!(lifecycle.registry().count(Stage::Chunker), 0);
}
