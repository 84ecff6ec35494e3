use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

use crate::state::ApiState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "conveyor-api"
    }))
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: Vec<DependencyCheck>,
}

#[derive(Debug, Serialize)]
pub struct DependencyCheck {
    pub name: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DependencyCheck {
    fn from_result<E: std::fmt::Display>(name: &'static str, result: Result<(), E>) -> Self {
        Self {
            name,
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

/// Pings every backing service; 503 unless all answer.
pub async fn readiness(State(state): State<ApiState>) -> (StatusCode, Json<ReadinessResponse>) {
    let mut checks = vec![
        DependencyCheck::from_result("broker", state.conveyor.broker().ping().await),
        DependencyCheck::from_result("store", state.conveyor.store().ping().await),
    ];
    if let Some(db) = &state.db {
        checks.push(DependencyCheck::from_result("database", db.ping().await));
    }

    let ready = checks.iter().all(|c| c.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unavailable" },
            checks,
        }),
    )
}
