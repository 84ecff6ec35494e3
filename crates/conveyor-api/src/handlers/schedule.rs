use axum::{extract::State, Json};

use conveyor_beat::ScheduleInfo;

use super::{from_core, ApiError};
use crate::state::ApiState;

pub async fn list_schedules(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ScheduleInfo>>, ApiError> {
    let schedules = state.beat.schedules().await.map_err(from_core)?;
    Ok(Json(schedules))
}
