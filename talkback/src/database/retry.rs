//! Connection-level retry for the job store.
//!
//! SQLite reports lock contention as `SQLITE_BUSY`/`SQLITE_LOCKED`. These are
//! retried here, below the job model, with their own capped exponential backoff.
//! Job-level retry (requeue with backoff) is a separate mechanism in the queue.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

/// Backoff settings for store operations that hit lock contention.
#[derive(Debug, Clone, Copy)]
pub struct BusyRetry {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self {
            max_retries: 12,
            base_delay_ms: 10,
            max_delay_ms: 2000,
        }
    }
}

impl BusyRetry {
    /// Delay before retry number `attempt` (0-indexed), without jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(32) as u32;
        let exp_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(exp_ms.min(self.max_delay_ms))
    }

    fn delay_with_jitter(&self, attempt: usize) -> Duration {
        let capped_ms = self.base_delay(attempt).as_millis() as u64;
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        Duration::from_millis((capped_ms + jitter_ms).min(self.max_delay_ms))
    }
}

pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run `op`, retrying while it fails with a busy/locked error.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_on_sqlite_busy_with(BusyRetry::default(), op_name, op).await
}

pub async fn retry_on_sqlite_busy_with<T, F, Fut>(
    policy: BusyRetry,
    op_name: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy_error(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }

                let delay = policy.delay_with_jitter(attempt);
                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    policy.max_retries
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
