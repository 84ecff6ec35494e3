//! Handlers every worker ships with.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::registry::{TaskContext, TaskError, TaskHandler, TaskRegistry};

/// Upper bound for `sleep` so a bad payload cannot pin a worker for hours.
const MAX_SLEEP_MILLIS: u64 = 10 * 60 * 1000;

pub fn register_all(registry: &mut TaskRegistry) {
    // Names are distinct constants, registration cannot collide.
    let _ = registry.register("echo", Echo);
    let _ = registry.register("add", Add);
    let _ = registry.register("sleep", Sleep);
    let _ = registry.register("cache.put", CachePut);
}

pub struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
        Ok(payload)
    }
}

#[derive(Deserialize)]
struct AddArgs {
    values: Vec<f64>,
}

pub struct Add;

#[async_trait]
impl TaskHandler for Add {
    async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
        let args: AddArgs = serde_json::from_value(payload)
            .map_err(|e| TaskError::fatal(format!("add expects {{\"values\": [numbers]}}: {}", e)))?;
        let sum: f64 = args.values.iter().sum();
        Ok(json!({ "sum": sum }))
    }
}

#[derive(Deserialize)]
struct SleepArgs {
    millis: u64,
}

pub struct Sleep;

#[async_trait]
impl TaskHandler for Sleep {
    async fn run(&self, ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
        let args: SleepArgs = serde_json::from_value(payload)
            .map_err(|e| TaskError::fatal(format!("sleep expects {{\"millis\": n}}: {}", e)))?;
        let millis = args.millis.min(MAX_SLEEP_MILLIS);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(json!({ "slept_ms": millis })),
            _ = ctx.cancelled() => Err(TaskError::retryable("sleep interrupted by shutdown")),
        }
    }
}

#[derive(Deserialize)]
struct CachePutArgs {
    key: String,
    value: Value,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

/// Writes an application cache entry through the result store.
pub struct CachePut;

#[async_trait]
impl TaskHandler for CachePut {
    async fn run(&self, ctx: &TaskContext, payload: Value) -> Result<Value, TaskError> {
        let args: CachePutArgs = serde_json::from_value(payload)
            .map_err(|e| TaskError::fatal(format!("cache.put expects {{\"key\", \"value\"}}: {}", e)))?;
        let ttl = args.ttl_secs.map(Duration::from_secs);
        ctx.store
            .cache_set(&args.key, &args.value, ttl)
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        Ok(json!({ "key": args.key }))
    }
}
