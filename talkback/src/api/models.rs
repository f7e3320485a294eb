//! API request and response models.
//!
//! Data Transfer Objects (DTOs) for the HTTP surface. Field names follow the
//! camelCase convention clients already use.

use serde::{Deserialize, Serialize};

use crate::database::models::JobCounts;
use crate::pipeline::{Job, JobStatus, SegmentResult};

// ============================================================================
// Chat DTOs
// ============================================================================

/// Body of `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Conversation owner. Defaults when absent.
    #[serde(default)]
    pub user_id: Option<String>,
    pub message: String,
}

/// Response of `POST /chat`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAcceptedResponse {
    /// Always `"processing"`.
    pub status: String,
    pub job_id: String,
    pub user_id: String,
}

impl ChatAcceptedResponse {
    pub fn new(job_id: String, user_id: String) -> Self {
        Self {
            status: "processing".to_string(),
            job_id,
            user_id,
        }
    }
}

// ============================================================================
// Status DTOs
// ============================================================================

/// Response of `GET /status/{job_id}`.
///
/// Which optional field is present depends on `status`: `progress` while
/// queued/active, `result` once completed, `error` once failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<SegmentResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        match job.status {
            JobStatus::Queued | JobStatus::Active => Self {
                status: job.status,
                progress: Some(job.progress),
                result: None,
                error: None,
            },
            JobStatus::Completed => Self {
                status: job.status,
                progress: None,
                result: Some(job.result.unwrap_or_default()),
                error: None,
            },
            JobStatus::Failed => Self {
                status: job.status,
                progress: None,
                result: None,
                error: Some(job.error.unwrap_or_default()),
            },
        }
    }
}

// ============================================================================
// Health DTOs
// ============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<JobCounts>,
}

/// Component health status.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}
