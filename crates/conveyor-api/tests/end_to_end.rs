//! Producer to worker round trip over the HTTP surface with in-memory backends.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use conveyor_api::{create_router, ApiState};
use conveyor_beat::Beat;
use conveyor_core::{Conveyor, MemoryBroker, MemoryStore, TaskRegistry};
use conveyor_worker::{Executor, WorkerPool, WorkerPoolConfig};

async fn call(state: &ApiState, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn wait_for_terminal(state: &ApiState, id: &str) -> Value {
    for _ in 0..200 {
        let request = Request::builder()
            .uri(format!("/tasks/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(state, request).await;
        assert_eq!(status, StatusCode::OK);
        if body["state"] == "Succeeded" || body["state"] == "Failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never finished", id);
}

#[tokio::test]
async fn test_submitted_task_is_executed_by_worker() {
    let broker = Arc::new(MemoryBroker::default());
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(TaskRegistry::with_builtins());

    let conveyor = Conveyor::new(broker.clone(), store.clone()).with_registry(registry.clone());
    let state = ApiState {
        beat: Arc::new(Beat::new(Vec::new(), conveyor.clone()).unwrap()),
        conveyor,
        db: None,
    };

    let executor = Executor::new("e2e-worker", broker.clone(), store.clone(), registry);
    let config = WorkerPoolConfig::new("e2e-worker")
        .with_concurrency(2)
        .with_poll_interval(Duration::from_millis(10))
        .with_heartbeat_interval(Duration::from_millis(50));
    let mut pool = WorkerPool::new(config, broker, store, executor);
    pool.start().await.unwrap();

    let submit = Request::builder()
        .method("POST")
        .uri("/tasks")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"name": "add", "payload": {"values": [2, 3.5]}}).to_string(),
        ))
        .unwrap();
    let (status, created) = call(&state, submit).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let done = wait_for_terminal(&state, created["id"].as_str().unwrap()).await;
    assert_eq!(done["state"], "Succeeded");
    assert_eq!(done["result"], json!({"sum": 5.5}));
    assert_eq!(done["attempts"], 1);
    assert!(done["runtime_ms"].is_number());

    // A payload the handler rejects fails without retries.
    let bad = Request::builder()
        .method("POST")
        .uri("/tasks")
        .header("content-type", "application/json")
        .body(Body::from(json!({"name": "add", "payload": {"x": 1}}).to_string()))
        .unwrap();
    let (_, created) = call(&state, bad).await;
    let failed = wait_for_terminal(&state, created["id"].as_str().unwrap()).await;
    assert_eq!(failed["state"], "Failed");
    assert!(failed["error"].as_str().unwrap().contains("add expects"));

    pool.shutdown().await.unwrap();
}
