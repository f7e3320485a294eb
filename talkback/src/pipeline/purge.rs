//! Job Purge Service for automatic cleanup of old completed/failed jobs.
//!
//! This service runs in the background and periodically purges jobs that have
//! exceeded their retention window. The same tick also returns jobs with
//! expired leases to the queue.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job_queue::JobQueue;
use crate::Result;
use crate::database::models::JobStatus;
use crate::database::time::duration_to_ms;

/// Configuration for job purging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Interval between sweeps in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Age after which completed jobs are deleted. 0 keeps them.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,

    /// Age after which failed jobs are deleted. 0 keeps them.
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,

    /// Newest completed jobs kept regardless of age, across all owners. 0 disables the cap.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: u64,

    /// Batch size for deletion to avoid long-running transactions.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_check_interval_secs() -> u64 {
    300
}

fn default_completed_retention_secs() -> u64 {
    3600
}

fn default_failed_retention_secs() -> u64 {
    24 * 3600
}

fn default_keep_completed() -> u64 {
    100
}

fn default_batch_size() -> u32 {
    100
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            completed_retention_secs: default_completed_retention_secs(),
            failed_retention_secs: default_failed_retention_secs(),
            keep_completed: default_keep_completed(),
            batch_size: default_batch_size(),
        }
    }
}

impl PurgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    pub fn with_completed_retention_secs(mut self, secs: u64) -> Self {
        self.completed_retention_secs = secs;
        self
    }

    pub fn with_failed_retention_secs(mut self, secs: u64) -> Self {
        self.failed_retention_secs = secs;
        self
    }

    pub fn with_keep_completed(mut self, keep: u64) -> Self {
        self.keep_completed = keep;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub completed_expired: u64,
    pub failed_expired: u64,
    pub completed_trimmed: u64,
    pub leases_reclaimed: usize,
}

impl PurgeReport {
    pub fn deleted(&self) -> u64 {
        self.completed_expired + self.failed_expired + self.completed_trimmed
    }
}

/// Job Purge Service for automatic cleanup of old jobs.
pub struct JobPurgeService {
    config: PurgeConfig,
    job_queue: Arc<JobQueue>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, job_queue: Arc<JobQueue>) -> Self {
        Self { config, job_queue }
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    /// Delete terminal jobs of `status` older than `retention_secs`, in batches.
    async fn purge_status(&self, status: JobStatus, retention_secs: u64) -> Result<u64> {
        if retention_secs == 0 {
            return Ok(0);
        }

        let repository = self.job_queue.repository();
        let batch_size = i64::from(self.config.batch_size.max(1));
        let cutoff_ms = self
            .job_queue
            .clock()
            .now_ms()
            .saturating_sub(duration_to_ms(Duration::from_secs(retention_secs)));

        let mut total_deleted: u64 = 0;
        loop {
            let deleted = repository
                .purge_finished_before(status, cutoff_ms, batch_size)
                .await?;
            total_deleted += deleted;

            if deleted < batch_size as u64 {
                break;
            }

            // Small delay between batches to reduce database load
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(total_deleted)
    }

    /// Run a single retention sweep.
    pub async fn run_purge(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport {
            completed_expired: self
                .purge_status(JobStatus::Completed, self.config.completed_retention_secs)
                .await?,
            failed_expired: self
                .purge_status(JobStatus::Failed, self.config.failed_retention_secs)
                .await?,
            ..Default::default()
        };

        if self.config.keep_completed > 0 {
            let keep = i64::try_from(self.config.keep_completed).unwrap_or(i64::MAX);
            report.completed_trimmed = self.job_queue.repository().trim_completed(keep).await?;
        }

        if report.deleted() > 0 {
            info!(
                completed = report.completed_expired,
                failed = report.failed_expired,
                trimmed = report.completed_trimmed,
                "Purged old jobs"
            );
        } else {
            debug!("No jobs to purge");
        }

        Ok(report)
    }

    /// One maintenance tick: reclaim lapsed leases, then purge.
    pub async fn run_maintenance(&self) -> Result<PurgeReport> {
        let leases_reclaimed = self.job_queue.reclaim_expired_leases().await?;
        let mut report = self.run_purge().await?;
        report.leases_reclaimed = leases_reclaimed;
        Ok(report)
    }

    /// Start the background maintenance task.
    pub fn start_background_task(&self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let service = JobPurgeService {
            config: self.config.clone(),
            job_queue: self.job_queue.clone(),
        };

        tokio::spawn(async move {
            let period = Duration::from_secs(service.config.check_interval_secs.max(1));
            let mut check_interval = interval(period);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Job purge service started (completed: {}s, failed: {}s, keep: {}, interval: {}s)",
                service.config.completed_retention_secs,
                service.config.failed_retention_secs,
                service.config.keep_completed,
                service.config.check_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = service.run_maintenance().await {
                            error!("Job maintenance failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
