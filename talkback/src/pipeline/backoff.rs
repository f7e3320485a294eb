//! Backoff policy for jobs that failed with a retryable error.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Growth curve of the delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `attempt * base`
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

impl BackoffKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Some(Self::Linear),
            "exponential" | "exp" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Deterministic, capped backoff. No jitter, so delays can be asserted exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default)]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Maximum delay in milliseconds.
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

fn default_base_ms() -> u64 {
    1000
}

fn default_cap_ms() -> u64 {
    30_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::default(),
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn linear(base: Duration, cap: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
        }
    }

    /// Delay before a job whose `attempt`-th claim failed becomes eligible again.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let raw_ms = match self.kind {
            BackoffKind::Linear => self.base_ms.saturating_mul(u64::from(attempt)),
            BackoffKind::Exponential => {
                let shift = (attempt - 1).min(63);
                self.base_ms.saturating_mul(1u64 << shift)
            }
        };

        Duration::from_millis(raw_ms.min(self.cap_ms))
    }

    /// Total delay accumulated over the requeues of a job that fails every attempt.
    pub fn total_delay(&self, max_attempts: u32) -> Duration {
        (1..max_attempts).map(|a| self.delay_for_attempt(a)).sum()
    }
}
