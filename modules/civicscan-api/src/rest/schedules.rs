use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;

use civicscan_orchestrator::{ScheduleRequest, ScheduleUpdate};

use super::{parse_id, ApiError};
use crate::AppState;

const DEFAULT_UPCOMING_HOURS: u32 = 24;

#[derive(Deserialize)]
pub struct UpcomingQuery {
    hours: Option<u32>,
}

pub async fn api_create_schedule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state.schedules.create_schedule(&body).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn api_update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ScheduleUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let schedule = state.schedules.update_schedule(id, &body).await?;
    Ok(Json(schedule))
}

pub async fn api_delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    state.schedules.delete_schedule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn api_upcoming_schedules(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UpcomingQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let hours = params.hours.unwrap_or(DEFAULT_UPCOMING_HOURS);
    let schedules = state.schedules.get_upcoming_schedules(hours).await?;
    Ok(Json(schedules))
}
