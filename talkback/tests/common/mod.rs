//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use talkback::clock::{Clock, ManualClock, SystemClock};
use talkback::pipeline::processors::{
    AudioTranscoder, LipSyncExtractor, ReplyGenerator, SpeechSynthesizer,
};
use talkback::pipeline::{BackoffPolicy, JobQueue, JobQueueConfig, PipelineExecutor};
use talkback::{Error, Result};

/// Fixed starting instant with whole milliseconds.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_767_225_600_000).unwrap()
}

pub fn sqlite_url(dir: &TempDir) -> String {
    format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("jobs.db").to_string_lossy().replace('\\', "/")
    )
}

pub fn queue_config(dir: &TempDir) -> JobQueueConfig {
    JobQueueConfig {
        database_url: sqlite_url(dir),
        ..Default::default()
    }
}

pub async fn open_queue(config: JobQueueConfig, clock: Arc<dyn Clock>) -> Arc<JobQueue> {
    Arc::new(JobQueue::open(config, clock).await.unwrap())
}

/// Queue on a manual clock with linear 1s/30s backoff and 3 attempts.
pub async fn manual_queue() -> (TempDir, Arc<JobQueue>, ManualClock) {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(epoch());
    let config = JobQueueConfig {
        backoff: BackoffPolicy::linear(Duration::from_secs(1), Duration::from_secs(30)),
        ..queue_config(&dir)
    };
    let queue = open_queue(config, Arc::new(clock.clone())).await;
    (dir, queue, clock)
}

pub async fn system_queue(config: JobQueueConfig) -> Arc<JobQueue> {
    open_queue(config, Arc::new(SystemClock)).await
}

/// JSON reply with one segment per text.
pub fn reply_json(texts: &[&str]) -> String {
    let messages: Vec<_> = texts
        .iter()
        .map(|text| {
            serde_json::json!({
                "text": text,
                "facialExpression": "smile",
                "animation": "Talking_1",
            })
        })
        .collect();
    serde_json::json!({ "messages": messages }).to_string()
}

/// Returns the same reply every time after a short delay.
pub struct StaticReply {
    pub body: String,
    pub delay: Duration,
}

#[async_trait]
impl ReplyGenerator for StaticReply {
    async fn generate(&self, _message: &str) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok(self.body.clone())
    }

    fn name(&self) -> &'static str {
        "static-reply"
    }
}

/// Always fails the way a timed-out upstream request does.
#[derive(Default)]
pub struct TimingOutReply {
    pub calls: AtomicU32,
}

#[async_trait]
impl ReplyGenerator for TimingOutReply {
    async fn generate(&self, _message: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err(Error::transient("reply generation: request timed out"))
    }

    fn name(&self) -> &'static str {
        "timing-out-reply"
    }
}

/// Audio tools that succeed after `delay`, writing the segment text as "audio".
pub struct FakeAudioTools {
    pub delay: Duration,
}

impl Default for FakeAudioTools {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(10),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeAudioTools {
    async fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        tokio::fs::write(dest, text.as_bytes()).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake-tts"
    }
}

#[async_trait]
impl AudioTranscoder for FakeAudioTools {
    async fn transcode(&self, src: &Path, dest: &Path) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        tokio::fs::copy(src, dest).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake-ffmpeg"
    }
}

#[async_trait]
impl LipSyncExtractor for FakeAudioTools {
    async fn extract(&self, _audio: &Path, _dest: &Path) -> Result<serde_json::Value> {
        tokio::time::sleep(self.delay).await;
        Ok(serde_json::json!({
            "metadata": { "duration": 0.5 },
            "mouthCues": [{ "start": 0.0, "end": 0.5, "value": "X" }]
        }))
    }

    fn name(&self) -> &'static str {
        "fake-rhubarb"
    }
}

pub fn executor_with(generator: Arc<dyn ReplyGenerator>, dir: &TempDir) -> Arc<PipelineExecutor> {
    let tools = Arc::new(FakeAudioTools::default());
    Arc::new(PipelineExecutor::new(
        generator,
        tools.clone(),
        tools.clone(),
        tools,
        dir.path().join("artifacts"),
    ))
}

/// Run one request through the router and decode the JSON body.
pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

pub fn post_chat(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}
