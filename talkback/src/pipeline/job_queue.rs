//! Database-backed job queue.
//!
//! `JobQueue` is the typed face of the job store: it validates payloads,
//! hands out leases on claim, decides between requeue and terminal failure,
//! wakes idle workers, and publishes [`JobEvent`]s for in-process observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::database::models::{JobCounts, JobDbModel, JobStatus as DbJobStatus};
use crate::database::repositories::{JobRepository, SqlxJobRepository};
use crate::database::time::{datetime_to_ms, duration_to_ms, ms_to_datetime};
use crate::database;
use crate::{Error, Result};

/// Maximum accepted message length, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;
/// Maximum accepted user id length, in characters.
pub const MAX_USER_ID_CHARS: usize = 128;
/// Owner used when a request does not name one.
pub const DEFAULT_USER_ID: &str = "default";

const EVENT_CHANNEL_CAPACITY: usize = 256;
const REAPER_BATCH_SIZE: i64 = 100;

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// SQLite connection URL of the job store.
    pub database_url: String,
    /// Claims allowed per job before it fails for good.
    pub max_attempts: u32,
    /// Delay policy for retryable failures.
    pub backoff: BackoffPolicy,
    /// How long a claim stays valid without a heartbeat.
    pub lease_ttl_secs: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:talkback.db?mode=rwc".to_string(),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            lease_ttl_secs: 30,
        }
    }
}

impl JobQueueConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Job status as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl From<DbJobStatus> for JobStatus {
    fn from(status: DbJobStatus) -> Self {
        match status {
            DbJobStatus::Queued => Self::Queued,
            DbJobStatus::Active => Self::Active,
            DbJobStatus::Completed => Self::Completed,
            DbJobStatus::Failed => Self::Failed,
        }
    }
}

/// Immutable input of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub user_id: String,
    pub message: String,
}

impl JobPayload {
    /// Build a validated payload. A missing or blank `user_id` becomes [`DEFAULT_USER_ID`].
    pub fn new(user_id: Option<String>, message: impl Into<String>) -> Result<Self> {
        let user_id = user_id
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string());
        let payload = Self {
            user_id,
            message: message.into(),
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<()> {
        if self.message.trim().is_empty() {
            return Err(Error::validation("message must not be empty"));
        }
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(Error::validation(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::validation("userId must not be empty"));
        }
        if self.user_id.chars().count() > MAX_USER_ID_CHARS {
            return Err(Error::validation(format!(
                "userId exceeds {} characters",
                MAX_USER_ID_CHARS
            )));
        }
        Ok(())
    }
}

/// One assembled reply segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentResult {
    pub text: String,
    /// Base64-encoded MP3.
    pub audio: String,
    /// Mouth-cue timing data as produced by the lip-sync extractor.
    pub lipsync: serde_json::Value,
    pub facial_expression: String,
    pub animation: String,
}

/// A job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub attempt: u32,
    pub max_attempts: u32,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<SegmentResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        let status = row.status().ok_or_else(|| {
            Error::Other(format!("job {} has unknown status '{}'", row.id, row.status))
        })?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<Vec<SegmentResult>>)
            .transpose()?;

        Ok(Self {
            id: row.id,
            status: status.into(),
            payload: JobPayload {
                user_id: row.user_id,
                message: row.message,
            },
            attempt: u32::try_from(row.attempt).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            progress: row.progress.clamp(0, 100) as u8,
            result,
            error: row.error,
            due_at: ms_to_datetime(row.due_at),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            finished_at: row.finished_at.map(ms_to_datetime),
        })
    }
}

/// A job held by one worker, together with the lease that proves it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease_id: String,
}

impl ClaimedJob {
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

/// Outcome of finishing an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Completed,
    /// Back to `queued`, claimable again at `due_at`.
    Requeued {
        attempt: u32,
        due_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Terminal failure with the stored error text.
    Failed { attempt: u32, error: String },
}

/// Queue events for in-process observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Enqueued {
        job_id: String,
        user_id: String,
    },
    Claimed {
        job_id: String,
        attempt: u32,
    },
    Progress {
        job_id: String,
        progress: u8,
    },
    Requeued {
        job_id: String,
        attempt: u32,
        due_at: DateTime<Utc>,
    },
    /// Handed back unfinished at shutdown; the attempt is not counted.
    Released {
        job_id: String,
    },
    Completed {
        job_id: String,
    },
    Failed {
        job_id: String,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Requeued { job_id, .. }
            | Self::Released { job_id }
            | Self::Completed { job_id }
            | Self::Failed { job_id, .. } => job_id,
        }
    }
}

/// Decide what happens to a job whose `attempt`-th run failed with `error`.
pub fn plan_failure(
    backoff: &BackoffPolicy,
    attempt: u32,
    max_attempts: u32,
    error: &Error,
    now_ms: i64,
) -> Transition {
    if !error.is_retryable() {
        return Transition::Failed {
            attempt,
            error: error.to_string(),
        };
    }

    if attempt < max_attempts {
        let delay = backoff.delay_for_attempt(attempt);
        let due_ms = now_ms.saturating_add(duration_to_ms(delay));
        return Transition::Requeued {
            attempt,
            due_at: ms_to_datetime(due_ms),
            delay,
        };
    }

    let exhausted = Error::ExhaustedRetries {
        attempts: attempt,
        last_error: error.to_string(),
    };
    Transition::Failed {
        attempt,
        error: exhausted.to_string(),
    }
}

/// Job queue backed by a [`JobRepository`].
pub struct JobQueue {
    config: JobQueueConfig,
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    /// Wakes idle workers when a job becomes claimable.
    notify: Arc<Notify>,
    event_tx: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    /// Open the SQLite store at `config.database_url` and apply migrations.
    pub async fn open(config: JobQueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let pool = database::init_pool(&config.database_url).await?;
        database::run_migrations(&pool).await?;
        let repository: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool));
        Ok(Self::with_repository(config, repository, clock))
    }

    /// Create a queue over an existing repository.
    pub fn with_repository(
        config: JobQueueConfig,
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            repository,
            clock,
            notify: Arc::new(Notify::new()),
            event_tx,
        }
    }

    /// Release the store's connections.
    pub async fn close(&self) {
        self.repository.close().await;
        info!("Job queue closed");
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        self.repository.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Validate and persist a new job, returning its id.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<String> {
        payload.validate()?;

        let row = JobDbModel::new_queued(
            &payload.user_id,
            &payload.message,
            self.config.max_attempts,
            self.clock.now_ms(),
        );
        self.repository.create_job(&row).await?;

        info!(job_id = %row.id, user_id = %payload.user_id, "Enqueued job");
        self.emit(JobEvent::Enqueued {
            job_id: row.id.clone(),
            user_id: payload.user_id,
        });
        self.notify.notify_one();

        Ok(row.id)
    }

    /// Claim the oldest due job, if any.
    pub async fn claim(&self) -> Result<Option<ClaimedJob>> {
        let now_ms = self.clock.now_ms();
        let lease_id = uuid::Uuid::new_v4().to_string();
        let lease_expires_at = now_ms.saturating_add(duration_to_ms(self.config.lease_ttl()));

        let Some(row) = self
            .repository
            .claim_next_job(now_ms, &lease_id, lease_expires_at)
            .await?
        else {
            return Ok(None);
        };

        let job = Job::try_from(row)?;
        debug!(job_id = %job.id, attempt = job.attempt, "Claimed job");
        self.emit(JobEvent::Claimed {
            job_id: job.id.clone(),
            attempt: job.attempt,
        });

        Ok(Some(ClaimedJob { job, lease_id }))
    }

    /// Extend the lease of a held job.
    pub async fn renew_lease(&self, claimed: &ClaimedJob) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let expires = now_ms.saturating_add(duration_to_ms(self.config.lease_ttl()));
        self.repository
            .renew_lease(claimed.id(), &claimed.lease_id, expires, now_ms)
            .await
    }

    /// Record progress for a held job; returns the stored (never lower) value.
    pub async fn update_progress(&self, claimed: &ClaimedJob, percent: u8) -> Result<u8> {
        let stored = self
            .repository
            .update_progress(
                claimed.id(),
                &claimed.lease_id,
                percent.min(100),
                self.clock.now_ms(),
            )
            .await?;

        self.emit(JobEvent::Progress {
            job_id: claimed.id().to_string(),
            progress: stored,
        });
        Ok(stored)
    }

    /// Store the result of a held job and mark it completed.
    pub async fn complete(
        &self,
        claimed: &ClaimedJob,
        results: &[SegmentResult],
    ) -> Result<Transition> {
        let result_json = serde_json::to_string(results)?;
        self.repository
            .complete_job(
                claimed.id(),
                &claimed.lease_id,
                &result_json,
                self.clock.now_ms(),
            )
            .await?;

        info!(
            job_id = %claimed.id(),
            attempt = claimed.job.attempt,
            segments = results.len(),
            "Job completed"
        );
        self.emit(JobEvent::Completed {
            job_id: claimed.id().to_string(),
        });
        Ok(Transition::Completed)
    }

    /// Give a held job back to the queue without charging the attempt.
    ///
    /// Used when a worker stops mid-job for shutdown: the job becomes
    /// claimable immediately with its attempt budget intact.
    pub async fn release(&self, claimed: &ClaimedJob) -> Result<()> {
        self.repository
            .release_job(claimed.id(), &claimed.lease_id, self.clock.now_ms())
            .await?;

        info!(
            job_id = %claimed.id(),
            attempt = claimed.job.attempt,
            "Job released back to the queue"
        );
        self.emit(JobEvent::Released {
            job_id: claimed.id().to_string(),
        });
        self.notify.notify_one();
        Ok(())
    }

    /// Report a failed attempt; requeues with backoff or fails for good.
    pub async fn fail(&self, claimed: &ClaimedJob, error: &Error) -> Result<Transition> {
        let now_ms = self.clock.now_ms();
        let transition = plan_failure(
            &self.config.backoff,
            claimed.job.attempt,
            claimed.job.max_attempts,
            error,
            now_ms,
        );

        match &transition {
            Transition::Requeued {
                attempt,
                due_at,
                delay,
            } => {
                self.repository
                    .requeue_job(
                        claimed.id(),
                        &claimed.lease_id,
                        datetime_to_ms(*due_at),
                        now_ms,
                    )
                    .await?;
                warn!(
                    job_id = %claimed.id(),
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job attempt failed, requeued"
                );
                self.emit(JobEvent::Requeued {
                    job_id: claimed.id().to_string(),
                    attempt: *attempt,
                    due_at: *due_at,
                });
                self.wake_after(*delay);
            }
            Transition::Failed {
                attempt,
                error: message,
            } => {
                self.repository
                    .fail_job(claimed.id(), &claimed.lease_id, message, now_ms)
                    .await?;
                warn!(job_id = %claimed.id(), attempt, error = %message, "Job failed");
                self.emit(JobEvent::Failed {
                    job_id: claimed.id().to_string(),
                    error: message.clone(),
                });
            }
            Transition::Completed => {}
        }

        Ok(transition)
    }

    /// Look up a job by id.
    pub async fn get(&self, id: &str) -> Result<Job> {
        let row = self.repository.get_job(id).await?;
        Job::try_from(row)
    }

    pub async fn stats(&self) -> Result<JobCounts> {
        self.repository.get_job_counts_by_status().await
    }

    /// Wait until a job may have become claimable.
    pub async fn wait_for_job(&self) {
        self.notify.notified().await;
    }

    fn wake_after(&self, delay: Duration) {
        if delay.is_zero() {
            self.notify.notify_one();
            return;
        }
        let notify = self.notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            notify.notify_one();
        });
    }

    /// Return jobs whose holder stopped renewing its lease to the queue.
    ///
    /// A lapsed lease counts as a retryable failure of that attempt, so a job
    /// that keeps losing its worker still fails once its attempts run out.
    pub async fn reclaim_expired_leases(&self) -> Result<usize> {
        let mut reclaimed = 0usize;

        loop {
            let now_ms = self.clock.now_ms();
            let expired = self
                .repository
                .list_expired_leases(now_ms, REAPER_BATCH_SIZE)
                .await?;
            let batch_len = expired.len();
            let mut batch_reclaimed = 0usize;

            for row in expired {
                let Some(lease_id) = row.lease_id.as_deref() else {
                    continue;
                };
                let attempt = u32::try_from(row.attempt).unwrap_or(0);
                let max_attempts = u32::try_from(row.max_attempts).unwrap_or(0);
                let cause = Error::transient("lease expired");

                match plan_failure(&self.config.backoff, attempt, max_attempts, &cause, now_ms) {
                    Transition::Requeued { due_at, delay, .. } => {
                        if self
                            .repository
                            .requeue_expired(&row.id, lease_id, datetime_to_ms(due_at), now_ms)
                            .await?
                        {
                            warn!(job_id = %row.id, attempt, "Lease expired, job requeued");
                            self.emit(JobEvent::Requeued {
                                job_id: row.id.clone(),
                                attempt,
                                due_at,
                            });
                            self.wake_after(delay);
                            batch_reclaimed += 1;
                        }
                    }
                    Transition::Failed { error, .. } => {
                        if self
                            .repository
                            .fail_expired(&row.id, lease_id, &error, now_ms)
                            .await?
                        {
                            warn!(job_id = %row.id, attempt, "Lease expired, job failed");
                            self.emit(JobEvent::Failed {
                                job_id: row.id.clone(),
                                error,
                            });
                            batch_reclaimed += 1;
                        }
                    }
                    Transition::Completed => {}
                }
            }

            reclaimed += batch_reclaimed;
            if batch_len < REAPER_BATCH_SIZE as usize || batch_reclaimed == 0 {
                break;
            }
        }

        if reclaimed > 0 {
            info!("Reclaimed {} jobs with expired leases", reclaimed);
        }
        Ok(reclaimed)
    }
}
