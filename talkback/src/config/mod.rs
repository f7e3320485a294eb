//! Application configuration.
//!
//! Everything is read from environment variables (optionally seeded from a
//! `.env` file). Unparsable values are logged and replaced by their defaults;
//! values that cannot work at all are rejected with [`Error::Configuration`].

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::api::ApiServerConfig;
use crate::error::{Error, Result};
use crate::pipeline::processors::{ElevenLabsConfig, OpenAiConfig};
use crate::pipeline::{BackoffKind, JobQueueConfig, PurgeConfig, WorkerPoolConfig};

/// Default directory for rotated log files.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Default directory for per-job audio and cue files.
pub const DEFAULT_ARTIFACTS_DIR: &str = "audios";

/// Fully resolved configuration for the service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub queue: JobQueueConfig,
    pub workers: WorkerPoolConfig,
    pub purge: PurgeConfig,
    pub api: ApiServerConfig,
    pub openai: OpenAiConfig,
    pub eleven_labs: ElevenLabsConfig,
    pub ffmpeg_path: String,
    pub rhubarb_path: String,
    pub artifacts_dir: PathBuf,
    pub log_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue: JobQueueConfig::default(),
            workers: WorkerPoolConfig::default(),
            purge: PurgeConfig::default(),
            api: ApiServerConfig::default(),
            openai: OpenAiConfig::default(),
            eleven_labs: ElevenLabsConfig::default(),
            ffmpeg_path: "ffmpeg".to_string(),
            rhubarb_path: "rhubarb".to_string(),
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
            log_dir: DEFAULT_LOG_DIR.to_string(),
        }
    }
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env_or_default() -> Result<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let env = Vars { lookup: &lookup };

        let mut queue = defaults.queue;
        if let Some(url) = env.string("DATABASE_URL") {
            queue.database_url = url;
        }
        queue.max_attempts = env.parse("JOB_MAX_ATTEMPTS", queue.max_attempts);
        queue.lease_ttl_secs = env
            .parse("JOB_LEASE_TTL_SECS", queue.lease_ttl_secs)
            .max(1);
        queue.backoff.base_ms = env.parse("JOB_BACKOFF_BASE_MS", queue.backoff.base_ms);
        queue.backoff.cap_ms = env.parse("JOB_BACKOFF_CAP_MS", queue.backoff.cap_ms);
        if let Some(kind) = env.string("JOB_BACKOFF_KIND") {
            match BackoffKind::parse(&kind) {
                Some(kind) => queue.backoff.kind = kind,
                None => warn!(
                    "Invalid JOB_BACKOFF_KIND '{}', using {:?}",
                    kind, queue.backoff.kind
                ),
            }
        }

        let mut workers = defaults.workers;
        workers.max_workers = env.parse("WORKER_CONCURRENCY", workers.max_workers);
        workers.poll_interval_ms = env.parse("WORKER_POLL_INTERVAL_MS", workers.poll_interval_ms);
        if env.string("JOB_TIMEOUT_SECS").is_some() {
            let secs = env.parse("JOB_TIMEOUT_SECS", workers.job_timeout_secs.unwrap_or(0));
            workers.job_timeout_secs = (secs > 0).then_some(secs);
        }

        let purge = defaults
            .purge
            .clone()
            .with_check_interval_secs(env.parse(
                "RETENTION_CHECK_INTERVAL_SECS",
                defaults.purge.check_interval_secs,
            ))
            .with_completed_retention_secs(env.parse(
                "RETENTION_COMPLETED_SECS",
                defaults.purge.completed_retention_secs,
            ))
            .with_failed_retention_secs(
                env.parse("RETENTION_FAILED_SECS", defaults.purge.failed_retention_secs),
            )
            .with_keep_completed(
                env.parse("RETENTION_KEEP_COMPLETED", defaults.purge.keep_completed),
            );

        let mut openai = defaults.openai;
        if let Some(key) = env.string("OPENAI_API_KEY") {
            openai.api_key = key;
        }
        if let Some(url) = env.string("OPENAI_BASE_URL") {
            openai.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = env.string("OPENAI_MODEL") {
            openai.model = model;
        }

        let mut eleven_labs = defaults.eleven_labs;
        if let Some(key) = env.string("ELEVEN_LABS_API_KEY") {
            eleven_labs.api_key = key;
        }
        if let Some(url) = env.string("ELEVEN_LABS_BASE_URL") {
            eleven_labs.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(voice) = env.string("ELEVEN_LABS_VOICE_ID") {
            eleven_labs.voice_id = voice;
        }
        if let Some(model) = env.string("ELEVEN_LABS_MODEL_ID") {
            eleven_labs.model_id = model;
        }

        let config = Self {
            queue,
            workers,
            purge,
            api: ApiServerConfig::from_lookup(&lookup),
            openai,
            eleven_labs,
            ffmpeg_path: env.string("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            rhubarb_path: env.string("RHUBARB_PATH").unwrap_or(defaults.rhubarb_path),
            artifacts_dir: env
                .string("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            log_dir: env.string("LOG_DIR").unwrap_or(defaults.log_dir),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.max_workers == 0 {
            return Err(Error::config("WORKER_CONCURRENCY must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::config("JOB_MAX_ATTEMPTS must be at least 1"));
        }
        if self.queue.backoff.cap_ms < self.queue.backoff.base_ms {
            warn!(
                base_ms = self.queue.backoff.base_ms,
                cap_ms = self.queue.backoff.cap_ms,
                "Backoff cap is below its base; every delay will equal the cap"
            );
        }
        Ok(())
    }
}

/// Typed access to a variable source.
struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    /// Non-blank value, trimmed.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Debug,
    {
        match self.string(key) {
            Some(raw) => match raw.parse::<T>() {
                Ok(value) => value,
                Err(_) => {
                    warn!("Invalid {} '{}', using {:?}", key, raw, default);
                    default
                }
            },
            None => default,
        }
    }
}
