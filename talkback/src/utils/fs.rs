//! Filesystem helpers for job artifacts.
//!
//! Failures here are resource errors: they carry the operation and path and
//! are retried with the job.

use std::path::Path;
use tracing::warn;

use crate::{Error, Result};

/// Convert an IO error into a resource error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::resource(format!("{} {}: {}", op, path.display(), source))
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Blocking variant of [`ensure_dir_all`] for use before the runtime does any work.
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))
}

pub async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| io_error("reading", path, e))
}

/// Remove a directory tree, logging instead of failing. A missing directory is fine.
pub async fn remove_dir_all_quietly(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_remove_dir_all_quietly() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("f.bin"), b"x").await.unwrap();

        remove_dir_all_quietly(&dir.path().join("a")).await;
        assert!(!dir.path().join("a").exists());

        // Already gone.
        remove_dir_all_quietly(&dir.path().join("a")).await;
    }

    #[tokio::test]
    async fn test_read_missing_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let err = read_file(&dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        assert!(err.is_retryable());
    }
}
