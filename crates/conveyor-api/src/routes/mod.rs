use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{handlers, state::ApiState};

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness))

        // Task endpoints
        .route("/tasks", post(handlers::task::submit_task))
        .route("/tasks", get(handlers::task::list_tasks))
        .route("/tasks/:task_id", get(handlers::task::get_task))
        .route("/tasks/:task_id/logs", get(handlers::task::get_task_logs))
        .route("/dead-letters", get(handlers::task::list_dead_letters))

        // Statistics
        .route("/stats", get(handlers::stats::get_statistics))
        .route("/workers", get(handlers::stats::list_workers))
        .route("/schedules", get(handlers::schedule::list_schedules))

        // Add state
        .with_state(state)

        .layer(TraceLayer::new_for_http())
        // Add CORS
        .layer(CorsLayer::permissive())
}
