//! Job repository.
//!
//! This is the job record store. Every transition out of `ACTIVE` is guarded by
//! the claim's `lease_id`, so only the current holder can move a job forward.
//! `claim_next_job` is the sole way into `ACTIVE` and is a single conditional
//! `UPDATE ... RETURNING`, which SQLite executes under its writer lock.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobCounts, JobDbModel, JobStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;

    /// Atomically claim the oldest due QUEUED job, returning the updated row.
    async fn claim_next_job(
        &self,
        now_ms: i64,
        lease_id: &str,
        lease_expires_at: i64,
    ) -> Result<Option<JobDbModel>>;

    /// Extend the holder's lease. Fails with `LeaseLost` if the lease is no longer held.
    async fn renew_lease(
        &self,
        id: &str,
        lease_id: &str,
        lease_expires_at: i64,
        now_ms: i64,
    ) -> Result<()>;

    /// Raise progress to at least `percent`; returns the stored value.
    async fn update_progress(
        &self,
        id: &str,
        lease_id: &str,
        percent: u8,
        now_ms: i64,
    ) -> Result<u8>;

    async fn complete_job(
        &self,
        id: &str,
        lease_id: &str,
        result_json: &str,
        now_ms: i64,
    ) -> Result<()>;

    /// Return an ACTIVE job to QUEUED, eligible again at `due_at`.
    async fn requeue_job(&self, id: &str, lease_id: &str, due_at: i64, now_ms: i64)
    -> Result<()>;

    /// Hand an ACTIVE job back to QUEUED, due now, refunding the attempt its claim charged.
    async fn release_job(&self, id: &str, lease_id: &str, now_ms: i64) -> Result<()>;

    async fn fail_job(&self, id: &str, lease_id: &str, error: &str, now_ms: i64) -> Result<()>;

    /// ACTIVE jobs whose lease expired at or before `now_ms`.
    async fn list_expired_leases(&self, now_ms: i64, limit: i64) -> Result<Vec<JobDbModel>>;

    /// Requeue a job whose lease is still the expired one observed by the reaper.
    async fn requeue_expired(
        &self,
        id: &str,
        lease_id: &str,
        due_at: i64,
        now_ms: i64,
    ) -> Result<bool>;

    /// Fail a job whose lease is still the expired one observed by the reaper.
    async fn fail_expired(
        &self,
        id: &str,
        lease_id: &str,
        error: &str,
        now_ms: i64,
    ) -> Result<bool>;

    async fn get_job_counts_by_status(&self) -> Result<JobCounts>;

    /// Delete up to `limit` terminal jobs of `status` that finished before `cutoff_ms`.
    async fn purge_finished_before(
        &self,
        status: JobStatus,
        cutoff_ms: i64,
        limit: i64,
    ) -> Result<u64>;

    /// Delete all but the newest `keep` COMPLETED jobs.
    async fn trim_completed(&self, keep: i64) -> Result<u64>;

    /// Release underlying connections.
    async fn close(&self) {}
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ensure_held(rows_affected: u64, id: &str) -> Result<()> {
    if rows_affected == 0 {
        return Err(Error::LeaseLost {
            job_id: id.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_job", || async {
            sqlx::query(
                r#"
                INSERT INTO job (
                    id, user_id, message, status, attempt, max_attempts, progress,
                    result, error, due_at, lease_id, lease_expires_at,
                    created_at, updated_at, finished_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.user_id)
            .bind(&job.message)
            .bind(&job.status)
            .bind(job.attempt)
            .bind(job.max_attempts)
            .bind(job.progress)
            .bind(&job.result)
            .bind(&job.error)
            .bind(job.due_at)
            .bind(&job.lease_id)
            .bind(job.lease_expires_at)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.finished_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn claim_next_job(
        &self,
        now_ms: i64,
        lease_id: &str,
        lease_expires_at: i64,
    ) -> Result<Option<JobDbModel>> {
        retry_on_sqlite_busy("claim_next_job", || async {
            let claimed = sqlx::query_as::<_, JobDbModel>(
                r#"
                UPDATE job SET
                    status = 'ACTIVE',
                    attempt = attempt + 1,
                    lease_id = ?,
                    lease_expires_at = ?,
                    updated_at = ?
                WHERE id = (
                    SELECT id FROM job
                    WHERE status = 'QUEUED' AND due_at <= ?
                    ORDER BY due_at ASC, created_at ASC, rowid ASC
                    LIMIT 1
                )
                AND status = 'QUEUED'
                RETURNING *
                "#,
            )
            .bind(lease_id)
            .bind(lease_expires_at)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
            Ok(claimed)
        })
        .await
    }

    async fn renew_lease(
        &self,
        id: &str,
        lease_id: &str,
        lease_expires_at: i64,
        now_ms: i64,
    ) -> Result<()> {
        let affected = retry_on_sqlite_busy("renew_lease", || async {
            let done = sqlx::query(
                r#"
                UPDATE job SET lease_expires_at = ?, updated_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ?
                "#,
            )
            .bind(lease_expires_at)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        ensure_held(affected, id)
    }

    async fn update_progress(
        &self,
        id: &str,
        lease_id: &str,
        percent: u8,
        now_ms: i64,
    ) -> Result<u8> {
        let percent = i64::from(percent.min(100));
        let stored: Option<i64> = retry_on_sqlite_busy("update_progress", || async {
            let row = sqlx::query_scalar::<_, i64>(
                r#"
                UPDATE job SET progress = MAX(progress, ?), updated_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ?
                RETURNING progress
                "#,
            )
            .bind(percent)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        match stored {
            Some(progress) => Ok(progress.clamp(0, 100) as u8),
            None => Err(Error::LeaseLost {
                job_id: id.to_string(),
            }),
        }
    }

    async fn complete_job(
        &self,
        id: &str,
        lease_id: &str,
        result_json: &str,
        now_ms: i64,
    ) -> Result<()> {
        let affected = retry_on_sqlite_busy("complete_job", || async {
            let done = sqlx::query(
                r#"
                UPDATE job SET
                    status = 'COMPLETED',
                    progress = 100,
                    result = ?,
                    error = NULL,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?,
                    finished_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ?
                "#,
            )
            .bind(result_json)
            .bind(now_ms)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        ensure_held(affected, id)
    }

    async fn requeue_job(
        &self,
        id: &str,
        lease_id: &str,
        due_at: i64,
        now_ms: i64,
    ) -> Result<()> {
        let affected = retry_on_sqlite_busy("requeue_job", || async {
            let done = sqlx::query(
                r#"
                UPDATE job SET
                    status = 'QUEUED',
                    due_at = ?,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ?
                "#,
            )
            .bind(due_at)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        ensure_held(affected, id)
    }

    async fn release_job(&self, id: &str, lease_id: &str, now_ms: i64) -> Result<()> {
        let affected = retry_on_sqlite_busy("release_job", || async {
            let done = sqlx::query(
                r#"
                UPDATE job SET
                    status = 'QUEUED',
                    attempt = MAX(attempt - 1, 0),
                    due_at = ?,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ?
                "#,
            )
            .bind(now_ms)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        ensure_held(affected, id)
    }

    async fn fail_job(&self, id: &str, lease_id: &str, error: &str, now_ms: i64) -> Result<()> {
        let affected = retry_on_sqlite_busy("fail_job", || async {
            let done = sqlx::query(
                r#"
                UPDATE job SET
                    status = 'FAILED',
                    error = ?,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?,
                    finished_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ?
                "#,
            )
            .bind(error)
            .bind(now_ms)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await?;
        ensure_held(affected, id)
    }

    async fn list_expired_leases(&self, now_ms: i64, limit: i64) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE status = 'ACTIVE' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?
            ORDER BY lease_expires_at ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn requeue_expired(
        &self,
        id: &str,
        lease_id: &str,
        due_at: i64,
        now_ms: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("requeue_expired", || async {
            let done = sqlx::query(
                r#"
                UPDATE job SET
                    status = 'QUEUED',
                    due_at = ?,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ? AND lease_expires_at <= ?
                "#,
            )
            .bind(due_at)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn fail_expired(
        &self,
        id: &str,
        lease_id: &str,
        error: &str,
        now_ms: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("fail_expired", || async {
            let done = sqlx::query(
                r#"
                UPDATE job SET
                    status = 'FAILED',
                    error = ?,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = ?,
                    finished_at = ?
                WHERE id = ? AND status = 'ACTIVE' AND lease_id = ? AND lease_expires_at <= ?
                "#,
            )
            .bind(error)
            .bind(now_ms)
            .bind(now_ms)
            .bind(id)
            .bind(lease_id)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
        .await
    }

    async fn get_job_counts_by_status(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => counts.queued = count,
                Some(JobStatus::Active) => counts.active = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::Failed) => counts.failed = count,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn purge_finished_before(
        &self,
        status: JobStatus,
        cutoff_ms: i64,
        limit: i64,
    ) -> Result<u64> {
        if !status.is_terminal() {
            return Err(Error::validation(format!(
                "refusing to purge non-terminal status {}",
                status
            )));
        }

        retry_on_sqlite_busy("purge_finished_before", || async {
            let done = sqlx::query(
                r#"
                DELETE FROM job WHERE id IN (
                    SELECT id FROM job
                    WHERE status = ? AND finished_at IS NOT NULL AND finished_at < ?
                    ORDER BY finished_at ASC
                    LIMIT ?
                )
                "#,
            )
            .bind(status.as_str())
            .bind(cutoff_ms)
            .bind(limit)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn trim_completed(&self, keep: i64) -> Result<u64> {
        retry_on_sqlite_busy("trim_completed", || async {
            let done = sqlx::query(
                r#"
                DELETE FROM job
                WHERE status = 'COMPLETED'
                AND id NOT IN (
                    SELECT id FROM job
                    WHERE status = 'COMPLETED'
                    ORDER BY finished_at DESC, rowid DESC
                    LIMIT ?
                )
                "#,
            )
            .bind(keep.max(0))
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlxJobRepository) {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("jobs.db").to_string_lossy().replace('\\', "/")
        );
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, SqlxJobRepository::new(pool))
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_respects_due_time() {
        let (_dir, repo) = setup().await;

        let first = JobDbModel::new_queued("u1", "first", 3, 1_000);
        let second = JobDbModel::new_queued("u1", "second", 3, 1_001);
        let mut later = JobDbModel::new_queued("u1", "later", 3, 900);
        later.due_at = 5_000;
        repo.create_job(&later).await.unwrap();
        repo.create_job(&second).await.unwrap();
        repo.create_job(&first).await.unwrap();

        let a = repo.claim_next_job(2_000, "l1", 9_000).await.unwrap().unwrap();
        let b = repo.claim_next_job(2_000, "l2", 9_000).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert_eq!(a.attempt, 1);
        assert_eq!(a.status, "ACTIVE");
        assert_eq!(a.lease_id.as_deref(), Some("l1"));

        // Not yet due.
        assert!(repo.claim_next_job(2_000, "l3", 9_000).await.unwrap().is_none());
        let c = repo.claim_next_job(5_000, "l3", 9_000).await.unwrap().unwrap();
        assert_eq!(c.id, later.id);
    }

    #[tokio::test]
    async fn test_holder_guard_rejects_stale_lease() {
        let (_dir, repo) = setup().await;
        let job = JobDbModel::new_queued("u1", "hi", 3, 1_000);
        repo.create_job(&job).await.unwrap();
        repo.claim_next_job(1_000, "lease-a", 2_000).await.unwrap().unwrap();

        let err = repo
            .update_progress(&job.id, "lease-b", 50, 1_100)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));

        assert_eq!(
            repo.update_progress(&job.id, "lease-a", 50, 1_100).await.unwrap(),
            50
        );
        // Progress never goes backwards.
        assert_eq!(
            repo.update_progress(&job.id, "lease-a", 20, 1_200).await.unwrap(),
            50
        );

        repo.complete_job(&job.id, "lease-a", "[]", 1_300).await.unwrap();
        let err = repo.fail_job(&job.id, "lease-a", "late", 1_400).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));

        let stored = repo.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, "COMPLETED");
        assert_eq!(stored.progress, 100);
        assert!(stored.error.is_none());
        assert_eq!(stored.finished_at, Some(1_300));
    }

    #[tokio::test]
    async fn test_expired_lease_guard() {
        let (_dir, repo) = setup().await;
        let job = JobDbModel::new_queued("u1", "hi", 3, 1_000);
        repo.create_job(&job).await.unwrap();
        repo.claim_next_job(1_000, "lease-a", 2_000).await.unwrap().unwrap();

        assert!(repo.list_expired_leases(1_999, 10).await.unwrap().is_empty());
        let expired = repo.list_expired_leases(2_000, 10).await.unwrap();
        assert_eq!(expired.len(), 1);

        // Holder renewed in between: reaper must not steal it.
        repo.renew_lease(&job.id, "lease-a", 4_000, 2_000).await.unwrap();
        assert!(!repo.requeue_expired(&job.id, "lease-a", 2_000, 2_000).await.unwrap());

        assert!(repo.requeue_expired(&job.id, "lease-a", 4_500, 4_000).await.unwrap());
        let stored = repo.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, "QUEUED");
        assert_eq!(stored.due_at, 4_500);
        assert!(stored.lease_id.is_none());
    }

    #[tokio::test]
    async fn test_release_refunds_attempt() {
        let (_dir, repo) = setup().await;
        let job = JobDbModel::new_queued("u1", "hi", 1, 1_000);
        repo.create_job(&job).await.unwrap();
        repo.claim_next_job(1_000, "lease-a", 2_000).await.unwrap().unwrap();

        let err = repo.release_job(&job.id, "lease-b", 1_500).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));

        repo.release_job(&job.id, "lease-a", 1_500).await.unwrap();
        let stored = repo.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, "QUEUED");
        assert_eq!(stored.attempt, 0);
        assert_eq!(stored.due_at, 1_500);
        assert!(stored.lease_id.is_none());

        let again = repo.claim_next_job(1_500, "lease-c", 3_000).await.unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn test_not_found() {
        let (_dir, repo) = setup().await;
        let err = repo.get_job("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_purge_refuses_non_terminal_status() {
        let (_dir, repo) = setup().await;
        let err = repo
            .purge_finished_before(JobStatus::Active, i64::MAX, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
