use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use conveyor_core::{EngineStatistics, WorkerHeartbeat};
use conveyor_db::AggregateStats;

use super::{from_core, ApiError};
use crate::state::ApiState;

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub engine_stats: EngineStatistics,
    pub db_stats: Option<AggregateStats>,
}

pub async fn get_statistics(State(state): State<ApiState>) -> Result<Json<StatsResponse>, ApiError> {
    let engine_stats = state.conveyor.statistics().await.map_err(from_core)?;

    // Get database statistics if available
    let db_stats = if let Some(ref db) = state.db {
        match db.get_aggregate_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::error!("Failed to get database stats: {}", e);
                None
            }
        }
    } else {
        None
    };

    Ok(Json(StatsResponse {
        engine_stats,
        db_stats,
    }))
}

pub async fn list_workers(
    State(state): State<ApiState>,
) -> Result<Json<Vec<WorkerHeartbeat>>, ApiError> {
    let workers = state.conveyor.workers().await.map_err(from_core)?;
    Ok(Json(workers))
}
