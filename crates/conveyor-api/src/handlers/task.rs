use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_core::{DeadLetter, SubmitRequest, Task, TaskOrigin, TaskState};
use conveyor_db::ExecutionLog;

use super::{api_error, from_core, ApiError};
use crate::state::ApiState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub state: TaskState,
    pub attempts: u32,
    pub max_retries: u32,
    pub origin: String,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
    pub runtime_ms: Option<i64>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        let runtime_ms = task.runtime().map(|d| d.num_milliseconds());
        Self {
            id: task.id,
            name: task.name,
            queue: task.queue,
            state: task.state,
            attempts: task.attempts,
            max_retries: task.max_retries,
            origin: task.origin.to_string(),
            payload: task.payload,
            result: task.result,
            error: task.error,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            eta: task.eta,
            runtime_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub state: Option<String>,
}

/// Queue a task
pub async fn submit_task(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    // History is written by the conveyor's submit hook, ahead of the enqueue.
    let task = state
        .conveyor
        .submit(request, TaskOrigin::Api)
        .await
        .map_err(from_core)?;

    Ok((StatusCode::ACCEPTED, Json(task.into())))
}

/// Latest state of a task: the result store first, then history
pub async fn get_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    if let Some(task) = state.conveyor.status(&task_id).await.map_err(from_core)? {
        return Ok(Json(task.into()));
    }

    if let Some(db) = &state.db {
        let record = db
            .get_task(&task_id)
            .await
            .map_err(|e| from_core(e.into()))?;
        if let Some(record) = record {
            let task = record.into_task().map_err(|e| from_core(e.into()))?;
            return Ok(Json(task.into()));
        }
    }

    Err(api_error(StatusCode::NOT_FOUND, "Task not found"))
}

/// Most recent tasks from history, optionally in one state; empty without
/// a database
pub async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<TaskState>)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let Some(db) = &state.db else {
        return Ok(Json(Vec::new()));
    };

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let records = match filter {
        Some(task_state) => db.get_tasks_by_state(task_state, limit).await,
        None => db.get_recent_tasks(limit).await,
    }
    .map_err(|e| from_core(e.into()))?;

    let tasks = records
        .into_iter()
        .filter_map(|record| match record.into_task() {
            Ok(task) => Some(TaskResponse::from(task)),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable task record");
                None
            }
        })
        .collect();

    Ok(Json(tasks))
}

pub async fn get_task_logs(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<ExecutionLog>>, ApiError> {
    let Some(db) = &state.db else {
        return Ok(Json(Vec::new()));
    };

    let logs = db
        .get_execution_logs(&task_id)
        .await
        .map_err(|e| from_core(e.into()))?;
    Ok(Json(logs))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// Tasks the workers gave up on, newest first
pub async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT as usize)
        .clamp(1, MAX_LIST_LIMIT as usize);

    let letters = state
        .conveyor
        .broker()
        .dead_letters(limit)
        .await
        .map_err(from_core)?;
    Ok(Json(letters))
}
