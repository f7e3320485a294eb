//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job database model.
/// One row per conversational request, from enqueue until retention removes it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Owner of the request.
    pub user_id: String,
    /// Free-text message to reply to.
    pub message: String,
    /// Status: QUEUED, ACTIVE, COMPLETED, FAILED
    pub status: String,
    /// Number of claims so far.
    pub attempt: i64,
    /// Attempt budget captured at enqueue time.
    pub max_attempts: i64,
    /// Percentage 0-100, never decreases.
    pub progress: i64,
    /// JSON array of segment results (COMPLETED only).
    pub result: Option<String>,
    /// Failure reason (FAILED only).
    pub error: Option<String>,
    /// Earliest time the job may be claimed (epoch ms).
    pub due_at: i64,
    /// Token of the current holder (ACTIVE only).
    pub lease_id: Option<String>,
    /// Liveness deadline of the current holder (epoch ms).
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    /// When the job reached a terminal status (epoch ms).
    pub finished_at: Option<i64>,
}

impl JobDbModel {
    /// Build a fresh QUEUED row due immediately.
    pub fn new_queued(
        user_id: impl Into<String>,
        message: impl Into<String>,
        max_attempts: u32,
        now_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            message: message.into(),
            status: JobStatus::Queued.as_str().to_string(),
            attempt: 0,
            max_attempts: i64::from(max_attempts),
            progress: 0,
            result: None,
            error: None,
            due_at: now_ms,
            lease_id: None,
            lease_expires_at: None,
            created_at: now_ms,
            updated_at: now_ms,
            finished_at: None,
        }
    }

    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly not yet due after a failed attempt).
    Queued,
    /// Held by exactly one worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed permanently or after exhausting attempts.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Job counts grouped by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}
