use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use conveyor_api::{create_router, ApiState};
use conveyor_beat::Beat;
use conveyor_core::{
    Broker, Cadence, Conveyor, MemoryBroker, MemoryStore, ResultStore, ScheduleEntry, Task,
    TaskRegistry, WorkerHeartbeat,
};

fn state() -> ApiState {
    let conveyor = Conveyor::new(Arc::new(MemoryBroker::default()), Arc::new(MemoryStore::new()))
        .with_registry(Arc::new(TaskRegistry::with_builtins()));
    let entries = vec![ScheduleEntry::new(
        "cleanup",
        "echo",
        Cadence::every(300).unwrap(),
    )];
    let beat = Beat::new(entries, conveyor.clone()).unwrap();

    ApiState {
        conveyor,
        db: None,
        beat: Arc::new(beat),
    }
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(create_router(state()), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy", "service": "conveyor-api"}));
}

#[tokio::test]
async fn test_ready_with_in_memory_backends() {
    let (status, body) = send(create_router(state()), get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_submit_then_fetch() {
    let state = state();

    let (status, created) = send(
        create_router(state.clone()),
        post_json("/tasks", json!({"name": "echo", "payload": {"n": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["state"], "Queued");
    assert_eq!(created["origin"], "api");

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = send(create_router(state.clone()), get(&format!("/tasks/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id);
    assert_eq!(fetched["payload"], json!({"n": 1}));

    let (_, stats) = send(create_router(state), get("/stats")).await;
    assert_eq!(stats["engine_stats"]["queue"]["pending"], 1);
    assert!(stats["db_stats"].is_null());
}

#[tokio::test]
async fn test_unknown_task_name_is_unprocessable() {
    let (status, body) = send(
        create_router(state()),
        post_json("/tasks", json!({"name": "launch_missiles"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("launch_missiles"));
}

#[tokio::test]
async fn test_missing_task_is_not_found() {
    let (status, body) = send(create_router(state()), get("/tasks/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Task not found");
}

#[tokio::test]
async fn test_lists_without_database_are_empty() {
    let (status, body) = send(create_router(state()), get("/tasks?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = send(create_router(state()), get("/tasks/abc/logs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_unknown_state_filter_is_bad_request() {
    let (status, body) = send(create_router(state()), get("/tasks?state=exploded")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("exploded"));

    let (status, body) = send(create_router(state()), get("/tasks?state=failed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_dead_letters_newest_first() {
    let state = state();
    let broker = state.conveyor.broker();
    for name in ["first", "second"] {
        let task = Task::new("echo", json!({ "tag": name }));
        broker.enqueue(&task).await.unwrap();
        let delivered = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        broker.dead_letter(&delivered, "gave up").await.unwrap();
    }

    let (status, letters) = send(create_router(state.clone()), get("/dead-letters")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(letters.as_array().unwrap().len(), 2);
    assert_eq!(letters[0]["task"]["payload"]["tag"], "second");
    assert_eq!(letters[0]["reason"], "gave up");

    let (_, limited) = send(create_router(state), get("/dead-letters?limit=1")).await;
    assert_eq!(limited.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_workers_and_schedules() {
    let state = state();
    let now = Utc::now();
    state
        .conveyor
        .store()
        .heartbeat(
            &WorkerHeartbeat {
                worker_id: "worker-1".to_string(),
                hostname: "worker-1".to_string(),
                queue: "default".to_string(),
                concurrency: 4,
                active: 1,
                processed: 10,
                failed: 2,
                started_at: now,
                last_seen: now,
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let (status, workers) = send(create_router(state.clone()), get("/workers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(workers[0]["worker_id"], "worker-1");

    let (status, schedules) = send(create_router(state), get("/schedules")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(schedules[0]["name"], "cleanup");
    assert_eq!(schedules[0]["cadence"], "every 300s");
}
