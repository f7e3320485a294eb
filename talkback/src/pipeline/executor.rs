//! Reply pipeline run by a worker for each claimed job.
//!
//! Stages, in order: generate the reply, then for every segment synthesize
//! speech, transcode it, extract lip-sync cues and report progress. Segments
//! are processed strictly one after another. A failure anywhere aborts the
//! attempt; the next attempt starts over from reply generation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::job_queue::{ClaimedJob, JobQueue, SegmentResult};
use super::processors::{
    AudioTranscoder, LipSyncExtractor, ReplyGenerator, SpeechSynthesizer, parse_reply,
};
use crate::Result;
use crate::utils::filename::sanitize_path_component;
use crate::utils::fs;

/// Scratch directory for one attempt, removed when the attempt ends.
///
/// The directory is also removed on drop so an attempt abandoned mid-way
/// (lease lost, timeout, shutdown) does not leave files behind.
struct ArtifactSession {
    dir: PathBuf,
    removed: bool,
}

impl ArtifactSession {
    async fn create(dir: PathBuf) -> Result<Self> {
        fs::ensure_dir_all(&dir).await?;
        Ok(Self {
            dir,
            removed: false,
        })
    }

    fn path(&self) -> &Path {
        &self.dir
    }

    async fn cleanup(mut self) {
        fs::remove_dir_all_quietly(&self.dir).await;
        self.removed = true;
    }
}

impl Drop for ArtifactSession {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

/// Runs the reply pipeline against injected collaborators.
pub struct PipelineExecutor {
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcoder: Arc<dyn AudioTranscoder>,
    lipsync: Arc<dyn LipSyncExtractor>,
    artifacts_dir: PathBuf,
}

impl PipelineExecutor {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcoder: Arc<dyn AudioTranscoder>,
        lipsync: Arc<dyn LipSyncExtractor>,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            generator,
            synthesizer,
            transcoder,
            lipsync,
            artifacts_dir: artifacts_dir.into(),
        }
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Fresh per-attempt directory under the owner's folder.
    fn session_dir(&self, user_id: &str) -> PathBuf {
        self.artifacts_dir
            .join(sanitize_path_component(user_id))
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Run one attempt of `claimed`, returning the assembled segments.
    ///
    /// Progress is written through `queue` under the claim's lease; a lost
    /// lease surfaces as [`crate::Error::LeaseLost`].
    pub async fn execute(
        &self,
        queue: &JobQueue,
        claimed: &ClaimedJob,
    ) -> Result<Vec<SegmentResult>> {
        let started = Instant::now();
        let session =
            ArtifactSession::create(self.session_dir(&claimed.job.payload.user_id)).await?;

        let outcome = self.run(queue, claimed, session.path()).await;
        session.cleanup().await;

        if let Ok(results) = &outcome {
            info!(
                job_id = %claimed.id(),
                segments = results.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Pipeline finished"
            );
        }
        outcome
    }

    async fn run(
        &self,
        queue: &JobQueue,
        claimed: &ClaimedJob,
        dir: &Path,
    ) -> Result<Vec<SegmentResult>> {
        let raw = self.generator.generate(&claimed.job.payload.message).await?;
        let segments = parse_reply(&raw)?;
        let total = segments.len();
        debug!(job_id = %claimed.id(), segments = total, "Reply generated");

        let mut results = Vec::with_capacity(total);
        for (index, segment) in segments.into_iter().enumerate() {
            let mp3 = dir.join(format!("message_{}.mp3", index));
            let wav = dir.join(format!("message_{}.wav", index));
            let cues = dir.join(format!("message_{}.json", index));

            self.synthesizer.synthesize(&segment.text, &mp3).await?;
            self.transcoder.transcode(&mp3, &wav).await?;
            let lipsync = self.lipsync.extract(&wav, &cues).await?;
            let audio = fs::read_file(&mp3).await?;

            results.push(SegmentResult {
                text: segment.text,
                audio: BASE64.encode(audio),
                lipsync,
                facial_expression: segment.facial_expression,
                animation: segment.animation,
            });

            let percent = ((index + 1) * 100 / total) as u8;
            queue.update_progress(claimed, percent).await?;
            debug!(
                job_id = %claimed.id(),
                segment = index,
                progress = percent,
                "Segment done"
            );
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::pipeline::job_queue::{JobPayload, JobQueueConfig};
    use crate::Error;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedReply(&'static str);

    #[async_trait]
    impl ReplyGenerator for FixedReply {
        async fn generate(&self, _message: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct WriteText;

    #[async_trait]
    impl SpeechSynthesizer for WriteText {
        async fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
            tokio::fs::write(dest, text.as_bytes()).await?;
            Ok(())
        }
        fn name(&self) -> &'static str {
            "write-text"
        }
    }

    #[async_trait]
    impl AudioTranscoder for WriteText {
        async fn transcode(&self, src: &Path, dest: &Path) -> Result<()> {
            tokio::fs::copy(src, dest).await?;
            Ok(())
        }
        fn name(&self) -> &'static str {
            "copy"
        }
    }

    #[async_trait]
    impl LipSyncExtractor for WriteText {
        async fn extract(&self, audio: &Path, _dest: &Path) -> Result<serde_json::Value> {
            assert!(audio.exists());
            Ok(serde_json::json!({ "mouthCues": [] }))
        }
        fn name(&self) -> &'static str {
            "static-cues"
        }
    }

    async fn setup(reply: &'static str) -> (TempDir, JobQueue, PipelineExecutor) {
        let dir = TempDir::new().unwrap();
        let config = JobQueueConfig {
            database_url: format!(
                "sqlite:{}?mode=rwc",
                dir.path().join("jobs.db").to_string_lossy().replace('\\', "/")
            ),
            ..Default::default()
        };
        let queue = JobQueue::open(config, Arc::new(SystemClock)).await.unwrap();
        let stub = Arc::new(WriteText);
        let executor = PipelineExecutor::new(
            Arc::new(FixedReply(reply)),
            stub.clone(),
            stub.clone(),
            stub,
            dir.path().join("artifacts"),
        );
        (dir, queue, executor)
    }

    #[tokio::test]
    async fn test_segments_in_order_and_artifacts_removed() {
        let (_dir, queue, executor) = setup(
            r#"{"messages":[
                {"text":"one","facialExpression":"smile","animation":"Talking_0"},
                {"text":"two","facialExpression":"sad","animation":"Crying"},
                {"text":"three","facialExpression":"default","animation":"Idle"}
            ]}"#,
        )
        .await;
        queue
            .enqueue(JobPayload::new(Some("u/1".to_string()), "hello").unwrap())
            .await
            .unwrap();
        let claimed = queue.claim().await.unwrap().unwrap();

        let results = executor.execute(&queue, &claimed).await.unwrap();
        let texts: Vec<_> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);
        assert_eq!(results[1].audio, BASE64.encode("two"));
        assert_eq!(results[2].facial_expression, "default");

        let job = queue.get(claimed.id()).await.unwrap();
        assert_eq!(job.progress, 100);

        let owner = executor.artifacts_dir().join("u_1");
        let mut entries = tokio::fs::read_dir(&owner).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_reply_is_not_retryable() {
        let (_dir, queue, executor) = setup("sorry, I can't do JSON").await;
        queue
            .enqueue(JobPayload::new(None, "hello").unwrap())
            .await
            .unwrap();
        let claimed = queue.claim().await.unwrap().unwrap();

        let err = executor.execute(&queue, &claimed).await.unwrap_err();
        assert!(matches!(err, Error::MalformedUpstreamOutput(_)));
        assert!(!err.is_retryable());
        assert_eq!(queue.get(claimed.id()).await.unwrap().progress, 0);
    }
}
