use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use conveyor_core::Error;

pub mod health;
pub mod schedule;
pub mod stats;
pub mod task;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Client mistakes map to 4xx, everything else is the server's problem.
pub fn from_core(err: Error) -> ApiError {
    let status = match &err {
        Error::UnknownTask(_) | Error::UnknownQueue(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
        _ => {
            tracing::error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, err.to_string())
}
