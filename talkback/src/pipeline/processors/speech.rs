//! Speech synthesis via an ElevenLabs-style text-to-speech API.

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::traits::SpeechSynthesizer;
use crate::utils::http_client::{build_http_client, request_error, status_error};
use crate::{Error, Result};

const SERVICE: &str = "speech synthesis";

#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: String,
    pub base_url: String,
    pub voice_id: String,
    pub model_id: String,
    pub request_timeout: Duration,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.elevenlabs.io".to_string(),
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: ElevenLabsConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::config("ELEVEN_LABS_API_KEY is not set"));
        }
        if config.voice_id.trim().is_empty() {
            return Err(Error::config("ELEVEN_LABS_VOICE_ID is not set"));
        }
        let client = build_http_client(config.request_timeout)?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.voice_id
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint())
            .header("xi-api-key", &self.config.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&SpeechRequest {
                text,
                model_id: &self.config.model_id,
            })
            .send()
            .await
            .map_err(|e| request_error(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| request_error(SERVICE, e))?;
        if audio.is_empty() {
            return Err(Error::transient("speech synthesis returned empty audio"));
        }

        tokio::fs::write(dest, &audio).await.map_err(|e| {
            Error::resource(format!("failed to write {}: {}", dest.display(), e))
        })?;

        debug!("Synthesized {} bytes to {}", audio.len(), dest.display());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "elevenlabs"
    }
}
