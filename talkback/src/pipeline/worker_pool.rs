//! Worker pool that claims jobs and runs them through the pipeline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::executor::PipelineExecutor;
use super::job_queue::{ClaimedJob, JobQueue, SegmentResult};
use crate::Error;

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrently running workers.
    pub max_workers: usize,
    /// Per-attempt time limit in seconds. `None` disables it.
    ///
    /// When it elapses the pipeline future is dropped and the attempt counts
    /// as a transient failure.
    pub job_timeout_secs: Option<u64>,
    /// Fallback poll interval in milliseconds while idle.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            job_timeout_secs: Some(300),
            poll_interval_ms: 1000,
        }
    }
}

/// How an attempt ended from the worker's point of view.
enum Outcome {
    Finished(crate::Result<Vec<SegmentResult>>),
    TimedOut(Duration),
    LeaseLost,
    Shutdown,
}

/// A fixed-size pool of workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Jobs currently being executed.
    active_jobs: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    pub fn with_config(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            active_jobs: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the workers.
    pub fn start(&self, job_queue: Arc<JobQueue>, executor: Arc<PipelineExecutor>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let job_timeout = self
            .config
            .job_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let heartbeat_interval =
            (job_queue.config().lease_ttl() / 3).max(Duration::from_millis(50));

        info!(
            "Starting worker pool with {} workers (lease heartbeat every {:?})",
            self.config.max_workers, heartbeat_interval
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool already stopped; not starting");
            return;
        };

        for i in 0..self.config.max_workers {
            let cancellation_token = self.cancellation_token.clone();
            let job_queue = job_queue.clone();
            let executor = executor.clone();
            let active_jobs = self.active_jobs.clone();

            join_set.spawn(async move {
                debug!("Worker {} started", i);

                loop {
                    if cancellation_token.is_cancelled() {
                        break;
                    }

                    match job_queue.claim().await {
                        Ok(Some(claimed)) => {
                            active_jobs.fetch_add(1, Ordering::SeqCst);
                            let span = info_span!("job", job_id = %claimed.id(), worker = i);
                            run_claimed_job(
                                &job_queue,
                                &executor,
                                claimed,
                                job_timeout,
                                heartbeat_interval,
                                &cancellation_token,
                            )
                            .instrument(span)
                            .await;
                            active_jobs.fetch_sub(1, Ordering::SeqCst);
                            // Look for more work before going idle.
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => error!("Worker {} failed to claim a job: {}", i, e),
                    }

                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = job_queue.wait_for_job() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                debug!("Worker {} shutting down", i);
            });
        }

        // Lease reaper: returns jobs whose holder stopped renewing.
        let cancellation_token = self.cancellation_token.clone();
        join_set.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(heartbeat_interval) => {}
                }
                if let Err(e) = job_queue.reclaim_expired_leases().await {
                    error!("Failed to reclaim expired leases: {}", e);
                }
            }
            debug!("Lease reaper shutting down");
        });
    }

    /// Stop the workers and wait for them to exit.
    ///
    /// A job in flight is interrupted and released back to the queue without
    /// charging its attempt.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Number of jobs currently executing.
    pub fn active_count(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep renewing the lease until `stop` fires; cancel `lost` if it is taken away.
async fn heartbeat(
    job_queue: Arc<JobQueue>,
    claimed: ClaimedJob,
    interval: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match job_queue.renew_lease(&claimed).await {
            Ok(()) => {}
            Err(Error::LeaseLost { .. }) => {
                warn!(job_id = %claimed.id(), "Lease lost, abandoning job");
                lost.cancel();
                return;
            }
            Err(e) => warn!(job_id = %claimed.id(), "Lease renewal failed: {}", e),
        }
    }
}

async fn run_claimed_job(
    job_queue: &Arc<JobQueue>,
    executor: &PipelineExecutor,
    claimed: ClaimedJob,
    job_timeout: Option<Duration>,
    heartbeat_interval: Duration,
    shutdown: &CancellationToken,
) {
    info!(attempt = claimed.job.attempt, "Processing job");

    let stop_heartbeat = CancellationToken::new();
    let lease_lost = CancellationToken::new();
    let heartbeat_task = tokio::spawn(heartbeat(
        job_queue.clone(),
        claimed.clone(),
        heartbeat_interval,
        stop_heartbeat.clone(),
        lease_lost.clone(),
    ));

    let pipeline = async {
        match job_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, executor.execute(job_queue, &claimed)).await {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => Outcome::TimedOut(limit),
                }
            }
            None => Outcome::Finished(executor.execute(job_queue, &claimed).await),
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Outcome::Shutdown,
        _ = lease_lost.cancelled() => Outcome::LeaseLost,
        outcome = pipeline => outcome,
    };

    stop_heartbeat.cancel();
    let _ = heartbeat_task.await;

    let failure = match outcome {
        Outcome::Finished(Ok(results)) => {
            if let Err(e) = job_queue.complete(&claimed, &results).await {
                warn!("Failed to record completion: {}", e);
            }
            return;
        }
        Outcome::Finished(Err(Error::LeaseLost { .. })) | Outcome::LeaseLost => {
            warn!("Lease lost during execution; leaving job to its new holder");
            return;
        }
        Outcome::Shutdown => {
            match job_queue.release(&claimed).await {
                Ok(()) => info!("Shutdown during execution; job released"),
                Err(e) => warn!(
                    "Failed to release job at shutdown, it returns when its lease expires: {}",
                    e
                ),
            }
            return;
        }
        Outcome::Finished(Err(e)) => e,
        Outcome::TimedOut(limit) => {
            Error::transient(format!("job timed out after {}s", limit.as_secs()))
        }
    };

    if let Err(e) = job_queue.fail(&claimed, &failure).await {
        warn!("Failed to record failure ({}): {}", failure, e);
    }
}
