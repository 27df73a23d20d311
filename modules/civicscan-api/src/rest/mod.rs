pub mod schedules;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use civicscan_common::{CivicScanError, JobFilter, JobStatus, ResultFilter};
use civicscan_orchestrator::SubmitRequest;

use crate::AppState;

// --- Errors ---

/// Maps the caller-facing error taxonomy onto HTTP statuses.
pub struct ApiError(CivicScanError);

impl From<CivicScanError> for ApiError {
    fn from(e: CivicScanError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CivicScanError::Validation(_) | CivicScanError::ScheduleParse { .. } => {
                StatusCode::BAD_REQUEST
            }
            CivicScanError::NotFound(_) => StatusCode::NOT_FOUND,
            CivicScanError::Conflict { .. } => StatusCode::CONFLICT,
            CivicScanError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self.0 {
            CivicScanError::Conflict {
                requested,
                existing,
                job_id,
            } => json!({
                "error": self.0.to_string(),
                "requested": requested,
                "existing": existing,
                "jobId": job_id,
            }),
            CivicScanError::Anyhow(e) => {
                warn!(error = %e, "Request failed");
                json!({ "error": "internal error" })
            }
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(CivicScanError::validation(format!("invalid id: {raw}"))))
}

// --- Query structs ---

#[derive(Deserialize)]
pub struct JobsQuery {
    status: Option<String>,
    jurisdiction: Option<String>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct ResultsQuery {
    jurisdiction: Option<String>,
    #[serde(rename = "type")]
    program_type: Option<String>,
    #[serde(alias = "jobId")]
    job_id: Option<Uuid>,
    since: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct DeltasQuery {
    since: Option<DateTime<Utc>>,
}

// --- Jobs ---

pub async fn api_submit_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_ids = state.orchestrator.submit_job(&body).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobIds": job_ids }))))
}

pub async fn api_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<JobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| ApiError(CivicScanError::Validation(e)))?;

    let jobs = state
        .orchestrator
        .get_jobs(&JobFilter {
            status,
            jurisdiction: params.jurisdiction,
            limit: params.limit,
        })
        .await?;
    Ok(Json(jobs))
}

pub async fn api_job_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    match state.orchestrator.get_job(id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(CivicScanError::NotFound(format!("job {id}")).into()),
    }
}

// --- Registry ---

pub async fn api_results(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ResultsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let programs = state
        .orchestrator
        .get_results(&ResultFilter {
            jurisdiction: params.jurisdiction,
            program_type: params.program_type,
            job_id: params.job_id,
            since: params.since,
        })
        .await?;
    Ok(Json(programs))
}

/// Change records since `since`, defaulting to the last 24 hours.
pub async fn api_deltas(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeltasQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let since = params
        .since
        .unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let changes = state.orchestrator.get_deltas(since).await?;
    Ok(Json(changes))
}
