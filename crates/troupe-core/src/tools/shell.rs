//! Shell tool for executing commands.
//!
//! Not pre-approved: every call goes through confirmation unless the session
//! has approved tools.

use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

use super::{Tool, ToolCall, ToolCallResult, ToolContext, ToolDefinition};

/// Maximum bytes per output stream (stdout/stderr) before truncation.
const MAX_OUTPUT_BYTES: usize = 40 * 1024;

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        "shell",
        "Execute a shell command in the working directory. Returns stdout, stderr and exit code.",
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        }),
    )
}

pub fn tool() -> Tool {
    Tool::new(definition(), |call: ToolCall, ctx: ToolContext| async move {
        execute(&call, &ctx).await
    })
}

#[derive(Debug, Deserialize)]
struct ShellInput {
    command: String,
}

/// Truncates at a valid UTF-8 boundary.
///
/// Returns the text and whether truncation occurred.
fn truncate_at_utf8_boundary(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    if bytes.len() <= max_bytes {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }
    let mut end = max_bytes;
    // Back up over continuation bytes (10xxxxxx) and the lead byte they belong to.
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    (String::from_utf8_lossy(&bytes[..end]).into_owned(), true)
}

async fn execute(call: &ToolCall, ctx: &ToolContext) -> Result<ToolCallResult> {
    let input: ShellInput = call.parse_arguments()?;
    if input.command.trim().is_empty() {
        return Ok(ToolCallResult::error("command cannot be empty"));
    }

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&input.command)
        .current_dir(&ctx.working_dir)
        // Non-interactive, dumb terminal: no colors or progress bars.
        .env("TERM", "dumb")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to execute command '{}'", input.command))?;

    let output = child.wait_with_output();
    let output = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => {
            return Ok(ToolCallResult::error("command canceled"));
        }
        result = async {
            match ctx.timeout {
                Some(limit) => tokio::time::timeout(limit, output).await.ok(),
                None => Some(output.await),
            }
        } => match result {
            Some(output) => output.with_context(|| format!("failed to execute command '{}'", input.command))?,
            None => {
                let secs = ctx.timeout.map_or(0, |t| t.as_secs());
                return Ok(ToolCallResult::error(format!("Command timed out after {secs} seconds")));
            }
        },
    };

    let (stdout, stdout_truncated) = truncate_at_utf8_boundary(&output.stdout, MAX_OUTPUT_BYTES);
    let (stderr, stderr_truncated) = truncate_at_utf8_boundary(&output.stderr, MAX_OUTPUT_BYTES);
    let exit_code = output.status.code().unwrap_or(-1);

    let body = json!({
        "stdout": stdout,
        "stderr": stderr,
        "exit_code": exit_code,
        "stdout_truncated": stdout_truncated,
        "stderr_truncated": stderr_truncated,
    });
    Ok(ToolCallResult {
        output: body.to_string(),
        is_error: exit_code != 0,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tempfile::TempDir;

    use super::*;

    fn shell_call(command: &str) -> ToolCall {
        ToolCall::new("1", "shell", json!({ "command": command }).to_string())
    }

    #[tokio::test]
    async fn test_shell_executes_in_working_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "x").unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());

        let result = execute(&shell_call("ls"), &ctx).await.unwrap();
        let data: Value = serde_json::from_str(&result.output).unwrap();
        assert!(data["stdout"].as_str().unwrap().contains("marker.txt"));
        assert_eq!(data["exit_code"], 0);
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_shell_nonzero_exit_is_error() {
        let temp = TempDir::new().unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());
        let result = execute(&shell_call("echo oops >&2; exit 42"), &ctx).await.unwrap();
        let data: Value = serde_json::from_str(&result.output).unwrap();
        assert_eq!(data["exit_code"], 42);
        assert!(data["stderr"].as_str().unwrap().contains("oops"));
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ToolContext::new(temp.path().to_path_buf());
        ctx.timeout = Some(Duration::from_millis(100));
        let result = execute(&shell_call("sleep 5"), &ctx).await.unwrap();
        assert!(result.is_error);
        assert!(result.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_shell_cancellation() {
        let temp = TempDir::new().unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());
        ctx.cancel.cancel();
        let result = execute(&shell_call("sleep 5"), &ctx).await.unwrap();
        assert_eq!(result.output, "command canceled");
    }

    #[test]
    fn test_truncate_respects_utf8() {
        let text = "aé".repeat(10);
        let (out, truncated) = truncate_at_utf8_boundary(text.as_bytes(), 2);
        assert!(truncated);
        assert_eq!(out, "a");
        let (out, truncated) = truncate_at_utf8_boundary(b"abc", 10);
        assert!(!truncated);
        assert_eq!(out, "abc");
    }
}
