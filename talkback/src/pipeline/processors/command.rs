//! Runs external command-line tools for the pipeline.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// Lines of stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Output of a finished tool invocation.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub duration: Duration,
    /// Last lines the tool wrote to stderr.
    pub stderr_tail: Vec<String>,
}

/// Run `program` with `args`, killing it if it outlives `timeout`.
///
/// Spawn failures, timeouts and non-zero exits are all transient: the tool
/// might be momentarily unavailable and the whole job is retried.
pub async fn run_tool<I, S>(program: &str, args: I, timeout: Duration) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::transient(format!("failed to spawn {}: {}", program, e)))?;

    let stdout_handle = child.stdout.take().map(|stdout| {
        let tool = program.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(tool = %tool, "stdout: {}", line);
            }
        })
    });

    let stderr_handle = child.stderr.take().map(|stderr| {
        let tool = program.to_string();
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.to_lowercase().contains("error") {
                    warn!(tool = %tool, "stderr: {}", line);
                } else {
                    debug!(tool = %tool, "stderr: {}", line);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        })
    });

    let waited = tokio::time::timeout(timeout, child.wait()).await;

    let status = match waited {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(Error::transient(format!(
                "failed to wait for {}: {}",
                program, e
            )));
        }
        Err(_) => {
            error!("{} timed out after {:?}", program, timeout);
            let _ = child.kill().await;
            return Err(Error::transient(format!(
                "{} timed out after {}s",
                program,
                timeout.as_secs()
            )));
        }
    };

    if let Some(handle) = stdout_handle {
        let _ = handle.await;
    }
    let stderr_tail: Vec<String> = match stderr_handle {
        Some(handle) => handle.await.map(Vec::from).unwrap_or_default(),
        None => Vec::new(),
    };

    if !status.success() {
        let detail = stderr_tail.last().cloned().unwrap_or_default();
        error!("{} exited with status {}", program, status);
        return Err(Error::transient(format!(
            "{} failed with exit code {}: {}",
            program,
            status.code().unwrap_or(-1),
            detail
        )));
    }

    Ok(CommandOutput {
        status,
        duration: start.elapsed(),
        stderr_tail,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_transient() {
        let err = run_tool("talkback-no-such-tool", ["--help"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransientExternal(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let err = run_tool(
            "sh",
            ["-c", "echo broken pipe >&2; exit 3"],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("broken pipe"), "{msg}");
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let err = run_tool("sh", ["-c", "sleep 5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_success_captures_tail() {
        let output = run_tool("sh", ["-c", "echo done >&2"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stderr_tail, vec!["done".to_string()]);
    }
}
