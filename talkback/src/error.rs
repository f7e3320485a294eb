//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    /// The caller no longer holds the lease on an active job.
    #[error("Lease lost for job {job_id}")]
    LeaseLost { job_id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Network failure, timeout, or failed invocation of an external service or tool.
    #[error("External call failed: {0}")]
    TransientExternal(String),

    /// Reply content that cannot be parsed or is structurally invalid.
    #[error("Malformed upstream output: {0}")]
    MalformedUpstreamOutput(String),

    /// Failure reading or writing job artifacts.
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("exhausted retries after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientExternal(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedUpstreamOutput(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Whether a pipeline failure of this kind may succeed on a later attempt.
    ///
    /// Malformed reply content and invalid payloads are permanent; everything a
    /// worker can hit while talking to collaborators or the filesystem is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MalformedUpstreamOutput(_)
            | Self::Validation(_)
            | Self::Configuration(_)
            | Self::ExhaustedRetries { .. }
            | Self::NotFound { .. } => false,
            Self::TransientExternal(_)
            | Self::Resource(_)
            | Self::Http(_)
            | Self::Io(_)
            | Self::DatabaseSqlx(_)
            | Self::Migration(_)
            | Self::Serialization(_)
            | Self::LeaseLost { .. }
            | Self::ApiError(_)
            | Self::Other(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::transient("timeout").is_retryable());
        assert!(Error::resource("disk full").is_retryable());
        assert!(!Error::malformed("not json").is_retryable());
        assert!(!Error::validation("empty message").is_retryable());
    }

    #[test]
    fn test_exhausted_retries_message() {
        let err = Error::ExhaustedRetries {
            attempts: 3,
            last_error: "External call failed: timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "exhausted retries after 3 attempts: External call failed: timeout"
        );
    }
}
