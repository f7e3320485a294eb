//! ffmpeg-based audio transcoder.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::command::run_tool;
use super::traits::AudioTranscoder;
use crate::Result;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Converts synthesized MP3 into WAV for the lip-sync extractor.
pub struct FfmpegTranscoder {
    /// Path to ffmpeg binary.
    ffmpeg_path: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    /// Use `ffmpeg` from `PATH`.
    pub fn new() -> Self {
        Self::with_path("ffmpeg")
    }

    /// Create with a custom ffmpeg path.
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(src: &Path, dest: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            src.to_string_lossy().into_owned(),
            dest.to_string_lossy().into_owned(),
        ]
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn transcode(&self, src: &Path, dest: &Path) -> Result<()> {
        let args = Self::build_args(src, dest);
        let output = run_tool(&self.ffmpeg_path, &args, self.timeout).await?;
        debug!(
            "Transcoded {} -> {} in {:.2}s",
            src.display(),
            dest.display(),
            output.duration.as_secs_f64()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}
