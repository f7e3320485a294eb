//! Job status route.
//!
//! Polling is read-only; it never retries or mutates a job.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};

use crate::api::error::ApiResult;
use crate::api::models::JobStatusResponse;
use crate::api::server::AppState;
use crate::pipeline::JobStatus;

/// Create the status router.
pub fn router() -> Router<AppState> {
    Router::new().route("/status/{job_id}", get(get_status))
}

/// Report a job's state. Failed jobs answer 500 with their stored error.
async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<(StatusCode, Json<JobStatusResponse>)> {
    let job = state.job_queue.get(&job_id).await?;
    let code = match job.status {
        JobStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    Ok((code, Json(JobStatusResponse::from(job))))
}
