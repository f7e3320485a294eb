//! Collaborator traits used by the pipeline executor.
//!
//! Each external service or tool sits behind one of these traits so the
//! executor can be driven by stubs in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// One reply fragment as produced by the text-generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySegment {
    pub text: String,
    pub facial_expression: String,
    pub animation: String,
}

/// Text generation.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Produce raw reply content (JSON text) for a user message.
    async fn generate(&self, message: &str) -> Result<String>;

    fn name(&self) -> &'static str;
}

/// Speech synthesis.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` and write the MP3 to `dest`.
    async fn synthesize(&self, text: &str, dest: &Path) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Audio format conversion.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    /// Convert `src` into the format implied by `dest`'s extension.
    async fn transcode(&self, src: &Path, dest: &Path) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Lip-sync timing extraction.
#[async_trait]
pub trait LipSyncExtractor: Send + Sync {
    /// Analyse `audio`, write the cues to `dest` and return them.
    ///
    /// # Cancel Safety
    ///
    /// Implementations spawning child processes must not leave them running
    /// when the returned future is dropped.
    async fn extract(&self, audio: &Path, dest: &Path) -> Result<serde_json::Value>;

    fn name(&self) -> &'static str;
}
