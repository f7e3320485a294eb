//! Asynchronous reply pipeline.
//!
//! The pipeline is responsible for:
//! - Queueing jobs durably and handing each to exactly one worker
//! - Running a fixed-size worker pool with lease heartbeats
//! - Producing reply segments through external collaborators
//! - Retrying transient failures with deterministic backoff
//! - Purging old completed/failed jobs and reclaiming lapsed leases

mod backoff;
mod executor;
mod job_queue;
pub mod processors;
mod purge;
mod worker_pool;

pub use backoff::{BackoffKind, BackoffPolicy};
pub use executor::PipelineExecutor;
pub use job_queue::{
    ClaimedJob, DEFAULT_USER_ID, Job, JobEvent, JobPayload, JobQueue, JobQueueConfig, JobStatus,
    MAX_MESSAGE_CHARS, MAX_USER_ID_CHARS, SegmentResult, Transition, plan_failure,
};
pub use purge::{JobPurgeService, PurgeConfig, PurgeReport};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
