//! Chat submission route.
//!
//! `POST /chat` validates the request, enqueues a job and returns immediately.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::post,
};
use tracing::info;

use crate::api::error::ApiResult;
use crate::api::models::{ChatAcceptedResponse, ChatRequest};
use crate::api::server::AppState;
use crate::pipeline::JobPayload;

/// Create the chat router.
pub fn router() -> Router<AppState> {
    Router::new().route("/chat", post(submit_chat))
}

/// Enqueue a reply job.
async fn submit_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ChatAcceptedResponse>)> {
    let Json(request) = body?;
    let payload = JobPayload::new(request.user_id, request.message)?;
    let user_id = payload.user_id.clone();

    let job_id = state.job_queue.enqueue(payload).await?;
    info!(job_id = %job_id, user_id = %user_id, "Accepted chat message");

    Ok((
        StatusCode::ACCEPTED,
        Json(ChatAcceptedResponse::new(job_id, user_id)),
    ))
}
