//! Thin HTTP client for the API, used by the client commands.

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use conveyor_api::handlers::stats::StatsResponse;
use conveyor_api::handlers::task::TaskResponse;
use conveyor_api::handlers::ErrorResponse;
use conveyor_core::{DeadLetter, SubmitRequest, TaskState};
use conveyor_db::ExecutionLog;

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<Value> {
        self.get("/health").await
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<TaskResponse> {
        let response = self
            .http
            .post(self.url("/tasks"))
            .json(request)
            .send()
            .await
            .with_context(|| format!("cannot reach API at {}", self.base_url))?;
        decode(response).await
    }

    /// `None` when the API does not know the task.
    pub async fn task(&self, task_id: &str) -> Result<Option<TaskResponse>> {
        let response = self
            .http
            .get(self.url(&format!("/tasks/{}", task_id)))
            .send()
            .await
            .with_context(|| format!("cannot reach API at {}", self.base_url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    pub async fn logs(&self, task_id: &str) -> Result<Vec<ExecutionLog>> {
        self.get(&format!("/tasks/{}/logs", task_id)).await
    }

    pub async fn recent(&self, limit: usize, state: Option<TaskState>) -> Result<Vec<TaskResponse>> {
        let path = match state {
            Some(state) => format!("/tasks?limit={}&state={}", limit, state.as_str()),
            None => format!("/tasks?limit={}", limit),
        };
        self.get(&path).await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.get(&format!("/dead-letters?limit={}", limit)).await
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        self.get("/stats").await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("cannot reach API at {}", self.base_url))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    bail!("API returned {}: {}", status.as_u16(), message)
}
