//! Read file tool.
//!
//! Reads UTF-8 text relative to the session's working directory, one line
//! window at a time. Pre-approved: it never waits for confirmation.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolCall, ToolCallResult, ToolContext, ToolDefinition};

/// Maximum number of lines returned per call.
const MAX_LINES: usize = 2000;

/// Maximum characters per line before truncation.
const MAX_LINE_LENGTH: usize = 500;

/// Deserialize an optional usize that may be provided as either a number or a string.
///
/// Models sometimes pass `"600"` instead of `600` for numeric fields.
fn deserialize_optional_usize<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("expected positive integer"))
            .and_then(|n| {
                usize::try_from(n)
                    .map(Some)
                    .map_err(|_| D::Error::custom("number too large"))
            }),
        Some(Value::String(s)) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid number string: {s}"))),
        Some(_) => Err(D::Error::custom("expected number or numeric string")),
    }
}

pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        "read_file",
        "Read a text file. Returns numbered lines; use offset/limit to page through large files.",
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file (relative to the working directory)"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed, default: 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default: 2000)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        }),
    )
    .read_only()
}

pub fn tool() -> Tool {
    Tool::new(definition(), |call: ToolCall, ctx: ToolContext| async move {
        execute(&call, &ctx)
    })
}

#[derive(Debug, Deserialize)]
struct ReadInput {
    path: String,
    #[serde(default, deserialize_with = "deserialize_optional_usize")]
    offset: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_optional_usize")]
    limit: Option<usize>,
}

fn execute(call: &ToolCall, ctx: &ToolContext) -> Result<ToolCallResult> {
    let input: ReadInput = call.parse_arguments()?;
    let requested = Path::new(&input.path);
    let path = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        ctx.working_dir.join(requested)
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            return Ok(ToolCallResult::error(format!(
                "Cannot read '{}': {e}",
                path.display()
            )));
        }
    };

    let offset = input.offset.unwrap_or(1).max(1);
    let limit = input.limit.unwrap_or(MAX_LINES).min(MAX_LINES);
    let total = content.lines().count();

    let mut out = String::new();
    for (idx, line) in content.lines().enumerate().skip(offset - 1).take(limit) {
        let line: String = line.chars().take(MAX_LINE_LENGTH).collect();
        let _ = writeln!(out, "{:>6}\t{line}", idx + 1);
    }

    let last = (offset - 1 + limit).min(total);
    if last < total {
        let _ = writeln!(
            out,
            "[showing lines {offset}-{last} of {total}; continue with offset={}]",
            last + 1
        );
    }
    Ok(ToolCallResult::success(out))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall::new("1", "read_file", args.to_string())
    }

    #[test]
    fn test_reads_relative_to_working_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());

        let result = execute(&call(json!({"path": "a.txt"})), &ctx).unwrap();
        assert!(!result.is_error);
        assert!(result.output.contains("     1\tone"));
        assert!(result.output.contains("     3\tthree"));
    }

    #[test]
    fn test_offset_and_limit_as_strings() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "1\n2\n3\n4\n").unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());

        let result = execute(
            &call(json!({"path": "a.txt", "offset": "2", "limit": 2})),
            &ctx,
        )
        .unwrap();
        assert!(result.output.contains("     2\t2"));
        assert!(!result.output.contains("     4\t4"));
        assert!(result.output.contains("continue with offset=4"));
    }

    #[test]
    fn test_missing_file_is_tool_error() {
        let temp = TempDir::new().unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());
        let result = execute(&call(json!({"path": "nope.txt"})), &ctx).unwrap();
        assert!(result.is_error);
        assert!(result.output.starts_with("Cannot read"));
    }

    #[test]
    fn test_definition_is_read_only() {
        assert!(definition().is_read_only());
    }
}
