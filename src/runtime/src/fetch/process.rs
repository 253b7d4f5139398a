//! Bounded execution of external tools.

use std::process::Stdio;
use std::time::Duration;

use lockbox_core::error::{LockboxError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default bound on a single external tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Run `cmd` to completion within `timeout`, optionally feeding `stdin`.
///
/// The child is killed if the timeout elapses or the returned future is
/// dropped. A non-zero exit is a collaborator failure carrying stderr.
pub async fn run_tool(
    tool: &str,
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    tracing::debug!(tool = %tool, command = ?cmd.as_std(), "Running");
    let mut child = cmd.spawn().map_err(|e| LockboxError::Collaborator {
        tool: tool.to_string(),
        message: format!("failed to start: {}", e),
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input)
            .await
            .map_err(|e| LockboxError::Collaborator {
                tool: tool.to_string(),
                message: format!("failed to write stdin: {}", e),
            })?;
        // Close stdin so the tool sees EOF
        drop(pipe);
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(|e| LockboxError::Collaborator {
            tool: tool.to_string(),
            message: e.to_string(),
        })?,
        Err(_) => {
            return Err(LockboxError::Timeout(format!(
                "{} did not finish within {}s",
                tool,
                timeout.as_secs()
            )));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LockboxError::Collaborator {
            tool: tool.to_string(),
            message: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(output.stdout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tool_success() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello");
        let out = run_tool("sh", cmd, None, Duration::from_secs(10)).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_tool_stdin() {
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let out = run_tool("cat", cmd, Some(b"secret"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out, b"secret");
    }

    #[tokio::test]
    async fn test_run_tool_failure_carries_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken >&2; exit 3");
        let err = run_tool("sh", cmd, None, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::Collaborator { .. }));
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_run_tool_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let err = run_tool("sleep", cmd, None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let cmd = Command::new("/nonexistent/tool");
        let err = run_tool("tool", cmd, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::Collaborator { .. }));
    }
}
