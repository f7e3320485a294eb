//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::error::ApiResult;
use crate::api::models::{ComponentHealth, HealthResponse};
use crate::api::server::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
}

/// Health check endpoint. Reports the job store and current job counts.
async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let uptime = state.start_time.elapsed().as_secs();

    let (store, jobs) = match state.job_queue.stats().await {
        Ok(counts) => (
            ComponentHealth {
                name: "job_store".to_string(),
                status: "healthy".to_string(),
                message: None,
            },
            Some(counts),
        ),
        Err(e) => (
            ComponentHealth {
                name: "job_store".to_string(),
                status: "unhealthy".to_string(),
                message: Some(e.to_string()),
            },
            None,
        ),
    };

    let status = if jobs.is_some() { "healthy" } else { "unhealthy" };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
        components: vec![store],
        jobs,
    }))
}

/// Liveness check - is the service alive?
/// Returns HTTP 200 with status and uptime if the service is responsive.
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}
