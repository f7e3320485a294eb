//! Rhubarb lip-sync extractor.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::command::run_tool;
use super::traits::LipSyncExtractor;
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RhubarbExtractor {
    rhubarb_path: String,
    timeout: Duration,
}

impl RhubarbExtractor {
    /// Use `rhubarb` from `PATH`.
    pub fn new() -> Self {
        Self::with_path("rhubarb")
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            rhubarb_path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(audio: &Path, dest: &Path) -> Vec<String> {
        vec![
            "-f".to_string(),
            "json".to_string(),
            "-o".to_string(),
            dest.to_string_lossy().into_owned(),
            audio.to_string_lossy().into_owned(),
            "-r".to_string(),
            "phonetic".to_string(),
        ]
    }
}

impl Default for RhubarbExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the cue file written by rhubarb.
///
/// Unreadable output is treated as a tool failure, not as malformed reply content.
pub fn parse_cues(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| Error::transient(format!("unreadable lip-sync output: {}", e)))?;
    if !value.is_object() {
        return Err(Error::transient("lip-sync output is not a JSON object"));
    }
    Ok(value)
}

#[async_trait]
impl LipSyncExtractor for RhubarbExtractor {
    async fn extract(&self, audio: &Path, dest: &Path) -> Result<serde_json::Value> {
        let args = Self::build_args(audio, dest);
        let output = run_tool(&self.rhubarb_path, &args, self.timeout).await?;

        let raw = tokio::fs::read_to_string(dest).await.map_err(|e| {
            Error::resource(format!("failed to read {}: {}", dest.display(), e))
        })?;
        debug!(
            "Extracted lip-sync cues for {} in {:.2}s",
            audio.display(),
            output.duration.as_secs_f64()
        );
        parse_cues(&raw)
    }

    fn name(&self) -> &'static str {
        "rhubarb"
    }
}
