//! Worker pool running the full pipeline with stub collaborators.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast::error::RecvError;

use axum::http::StatusCode;
use talkback::Error;
use talkback::api::{ApiServerConfig, AppState, build_router};
use talkback::pipeline::{
    BackoffPolicy, JobEvent, JobPayload, JobQueue, JobQueueConfig, JobStatus, WorkerPool,
    WorkerPoolConfig,
};

use common::{
    StaticReply, TimingOutReply, executor_with, get, post_chat, queue_config, reply_json, send,
    system_queue,
};

fn pool_config(workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        max_workers: workers,
        job_timeout_secs: Some(30),
        poll_interval_ms: 20,
    }
}

/// Collect events for `job_id` until it reaches a terminal state.
async fn events_until_terminal(
    events: &mut tokio::sync::broadcast::Receiver<JobEvent>,
    job_id: &str,
) -> Vec<JobEvent> {
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Ok(event)) => {
                if event.job_id() != job_id {
                    continue;
                }
                let terminal = matches!(
                    event,
                    JobEvent::Completed { .. } | JobEvent::Failed { .. }
                );
                seen.push(event);
                if terminal {
                    return seen;
                }
            }
            Ok(Err(RecvError::Lagged(n))) => panic!("event receiver lagged by {n}"),
            Ok(Err(RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for job {job_id}; saw {seen:?}"),
        }
    }
}

async fn wait_for_terminal(queue: &JobQueue, job_id: &str) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = queue.get(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
        assert!(Instant::now() < deadline, "job {job_id} never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_segment_reply_completes_in_order() {
    let dir = TempDir::new().unwrap();
    let queue = system_queue(queue_config(&dir)).await;
    let executor = executor_with(
        Arc::new(StaticReply {
            body: reply_json(&["Hello there!", "How can I help?"]),
            delay: Duration::from_millis(10),
        }),
        &dir,
    );
    let router = build_router(AppState::new(queue.clone()), &ApiServerConfig::default());

    let pool = WorkerPool::with_config(pool_config(2));
    pool.start(queue.clone(), executor.clone());

    let mut events = queue.subscribe();
    let (status, body) = send(&router, post_chat(r#"{"userId":"u1","message":"hello"}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let collector = {
        let job_id = job_id.clone();
        tokio::spawn(async move { events_until_terminal(&mut events, &job_id).await })
    };

    // Poll the way a client does until the job settles.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut polled = Vec::new();
    let finished = loop {
        let (status, body) = send(&router, get(&format!("/status/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        match body["status"].as_str() {
            Some("completed") => break body,
            Some("queued") | Some("active") => polled.push(body["progress"].as_u64().unwrap()),
            other => panic!("unexpected status {other:?}: {body}"),
        }
        assert!(Instant::now() < deadline, "job {job_id} never completed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert!(
        polled.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {polled:?}"
    );
    assert!(finished.get("progress").is_none());
    let result = finished["result"].as_array().unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0]["text"], "Hello there!");
    assert_eq!(result[1]["text"], "How can I help?");
    assert!(!result[0]["audio"].as_str().unwrap().is_empty());
    assert!(result[0]["lipsync"].get("mouthCues").is_some());

    let seen = collector.await.unwrap();
    let progress: Vec<u8> = seen
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![50, 100]);
    assert!(matches!(seen.last(), Some(JobEvent::Completed { .. })));
    assert_eq!(queue.get(&job_id).await.unwrap().attempt, 1);

    pool.stop().await;

    // Per-job artifacts are gone once the job is done.
    let owner_dir = executor.artifacts_dir().join("u1");
    if owner_dir.exists() {
        let mut entries = tokio::fs::read_dir(&owner_dir).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_mid_job_releases_it_without_charging_an_attempt() {
    let dir = TempDir::new().unwrap();
    let config = JobQueueConfig {
        max_attempts: 1,
        ..queue_config(&dir)
    };
    let queue = system_queue(config).await;
    let executor = executor_with(
        Arc::new(StaticReply {
            body: reply_json(&["too slow"]),
            delay: Duration::from_secs(60),
        }),
        &dir,
    );

    let mut events = queue.subscribe();
    let pool = WorkerPool::with_config(pool_config(1));
    pool.start(queue.clone(), executor);

    let job_id = queue
        .enqueue(JobPayload::new(None, "hello").unwrap())
        .await
        .unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("job was never claimed")
            .unwrap();
        if matches!(event, JobEvent::Claimed { .. }) && event.job_id() == job_id {
            break;
        }
    }

    tokio::time::timeout(Duration::from_secs(5), pool.stop())
        .await
        .expect("stop waited for the in-flight job");

    let job = queue.get(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 0);
    assert!(job.error.is_none());

    let mut released = false;
    while let Ok(event) = events.try_recv() {
        released |= event == JobEvent::Released { job_id: job_id.clone() };
    }
    assert!(released);

    // No lease is left behind for the reaper to charge.
    assert_eq!(queue.reclaim_expired_leases().await.unwrap(), 0);
    let claimed = queue.claim().await.unwrap().unwrap();
    assert_eq!(claimed.id(), job_id);
    assert_eq!(claimed.job.attempt, 1);
    assert_eq!(claimed.job.max_attempts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_pool_reclaims_an_abandoned_lease() {
    let dir = TempDir::new().unwrap();
    let config = JobQueueConfig {
        lease_ttl_secs: 1,
        backoff: BackoffPolicy::linear(Duration::from_millis(10), Duration::from_millis(10)),
        ..queue_config(&dir)
    };
    let queue = system_queue(config).await;

    let job_id = queue
        .enqueue(JobPayload::new(None, "hello").unwrap())
        .await
        .unwrap();
    // A holder that crashed right after claiming: it never renews.
    let abandoned = queue.claim().await.unwrap().unwrap();
    assert_eq!(abandoned.id(), job_id);

    let executor = executor_with(
        Arc::new(StaticReply {
            body: reply_json(&["back again"]),
            delay: Duration::ZERO,
        }),
        &dir,
    );
    let pool = WorkerPool::with_config(pool_config(1));
    let started = Instant::now();
    pool.start(queue.clone(), executor);

    assert_eq!(wait_for_terminal(&queue, &job_id).await, JobStatus::Completed);
    let elapsed = started.elapsed();
    pool.stop().await;

    // One TTL plus one reaper tick, with room for a slow machine.
    assert!(elapsed < Duration::from_secs(5), "reclaimed after {elapsed:?}");
    let job = queue.get(&job_id).await.unwrap();
    assert_eq!(job.attempt, 2);

    let err = queue.renew_lease(&abandoned).await.unwrap_err();
    assert!(matches!(err, Error::LeaseLost { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_timing_out_generator_fails_after_max_attempts() {
    let dir = TempDir::new().unwrap();
    let backoff = BackoffPolicy::linear(Duration::from_millis(100), Duration::from_secs(1));
    let config = JobQueueConfig {
        max_attempts: 3,
        backoff: backoff.clone(),
        ..queue_config(&dir)
    };
    let queue = system_queue(config).await;
    let generator = Arc::new(TimingOutReply::default());
    let executor = executor_with(generator.clone(), &dir);

    let pool = WorkerPool::with_config(pool_config(2));
    pool.start(queue.clone(), executor);

    let started = Instant::now();
    let job_id = queue
        .enqueue(JobPayload::new(None, "hello").unwrap())
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&queue, &job_id).await, JobStatus::Failed);
    let elapsed = started.elapsed();
    pool.stop().await;

    let job = queue.get(&job_id).await.unwrap();
    assert_eq!(job.attempt, 3);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    let error = job.error.unwrap();
    assert!(error.starts_with("exhausted retries after 3 attempts"), "{error}");
    assert!(error.contains("timed out"));

    // 100ms after the first failure, 200ms after the second.
    assert!(
        elapsed >= backoff.total_delay(3),
        "finished in {elapsed:?}, expected at least {:?}",
        backoff.total_delay(3)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_reply_fails_without_retry() {
    let dir = TempDir::new().unwrap();
    let queue = system_queue(queue_config(&dir)).await;
    let executor = executor_with(
        Arc::new(StaticReply {
            body: "I'd rather just talk.".to_string(),
            delay: Duration::ZERO,
        }),
        &dir,
    );

    let pool = WorkerPool::with_config(pool_config(1));
    pool.start(queue.clone(), executor);

    let job_id = queue
        .enqueue(JobPayload::new(None, "hello").unwrap())
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&queue, &job_id).await, JobStatus::Failed);
    pool.stop().await;

    let job = queue.get(&job_id).await.unwrap();
    assert_eq!(job.attempt, 1);
    assert!(job.error.unwrap().starts_with("Malformed upstream output"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_job_reaches_a_terminal_state() {
    let dir = TempDir::new().unwrap();
    let queue = system_queue(queue_config(&dir)).await;
    let executor = executor_with(
        Arc::new(StaticReply {
            body: reply_json(&["a", "b", "c"]),
            delay: Duration::from_millis(1),
        }),
        &dir,
    );

    let pool = WorkerPool::with_config(pool_config(3));
    pool.start(queue.clone(), executor);

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = queue
            .enqueue(JobPayload::new(Some(format!("user-{}", i % 3)), format!("m{i}")).unwrap())
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        assert_eq!(wait_for_terminal(&queue, id).await, JobStatus::Completed);
    }
    pool.stop().await;
    assert_eq!(pool.active_count(), 0);

    let counts = queue.stats().await.unwrap();
    assert_eq!(counts.completed, 12);
}
