//! Streamed stdout/stderr rendering and the turn driver.
//!
//! Assistant text goes to stdout; tool activity, warnings, errors and
//! prompts go to stderr. Suspensions are answered from stdin.

use std::io::{self, Write};

use anyhow::{Result, anyhow};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio_util::sync::CancellationToken;
use troupe_core::core::events::{CompactionStatus, ElicitationMode, Event};
use troupe_core::core::interrupt::{self, InterruptedError};
use troupe_core::runtime::{ResumeRequest, Runtime};
use troupe_core::session::SharedSession;
use troupe_core::tools::{ElicitationAction, ToolCall};

const MAX_ARGS_PREVIEW: usize = 120;

/// Writes events to an output and an error stream.
pub struct ExecRenderer<O: Write, E: Write> {
    out: O,
    err: E,
    /// Whether assistant text is waiting for its final newline.
    needs_final_newline: bool,
}

impl ExecRenderer<io::Stdout, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }
}

impl<O: Write, E: Write> ExecRenderer<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            needs_final_newline: false,
        }
    }

    fn finish_line(&mut self) {
        if self.needs_final_newline {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
            self.needs_final_newline = false;
        }
    }

    pub fn handle_event(&mut self, event: &Event) {
        match event {
            Event::AgentChoice { content, .. } => {
                if !content.is_empty() {
                    let _ = write!(self.out, "{content}");
                    let _ = self.out.flush();
                    self.needs_final_newline = !content.ends_with('\n');
                }
            }
            Event::ToolCall { tool_call, .. } => {
                self.finish_line();
                let _ = writeln!(self.err, "⚙ {}", describe_call(tool_call));
            }
            Event::ToolCallResponse {
                tool_call,
                response,
                is_error,
                ..
            } => {
                if *is_error {
                    let first = response.lines().next().unwrap_or_default();
                    let _ = writeln!(self.err, "✗ {}: {first}", tool_call.name);
                } else {
                    let _ = writeln!(self.err, "✓ {}", tool_call.name);
                }
            }
            Event::AgentSwitching {
                switching: true,
                from_agent,
                to_agent,
            } => {
                self.finish_line();
                let _ = writeln!(self.err, "↪ {from_agent} → {to_agent}");
            }
            Event::SessionCompaction {
                status: CompactionStatus::Started,
                ..
            } => {
                self.finish_line();
                let _ = writeln!(self.err, "Compacting session...");
            }
            Event::Authorization { action, .. } => {
                let _ = writeln!(self.err, "Authorization: {action}");
            }
            Event::Warning { message, .. } => {
                self.finish_line();
                let _ = writeln!(self.err, "Warning: {message}");
            }
            Event::Error { message, .. } => {
                self.finish_line();
                let _ = writeln!(self.err, "Error: {message}");
            }
            Event::ToolCallConfirmation { .. }
            | Event::MaxIterationsReached { .. }
            | Event::ElicitationRequest { .. }
            | Event::StreamStopped { .. } => self.finish_line(),
            _ => {}
        }
        let _ = self.err.flush();
    }
}

fn describe_call(call: &ToolCall) -> String {
    let args: String = call.arguments.chars().take(MAX_ARGS_PREVIEW).collect();
    if args.len() < call.arguments.len() {
        format!("{}({args}…)", call.name)
    } else {
        format!("{}({args})", call.name)
    }
}

/// Reads answers to suspension prompts line by line.
pub struct Prompter<R> {
    lines: Lines<BufReader<R>>,
}

impl Prompter<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

impl<R: AsyncRead + Unpin> Prompter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Asks `question` on stderr. `None` on end of input or cancellation.
    async fn ask(&mut self, cancel: &CancellationToken, question: &str) -> Option<String> {
        eprint!("{question}");
        let _ = io::stderr().flush();
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            line = self.lines.next_line() => match line {
                Ok(line) => line.map(|l| l.trim().to_string()),
                Err(e) => {
                    tracing::warn!("reading answer failed: {e}");
                    None
                }
            },
        }
    }
}

/// `y` approves, `a` approves for the session, anything else rejects.
fn confirmation_decision(answer: Option<&str>) -> ResumeRequest {
    match answer.map(str::to_ascii_lowercase).as_deref() {
        Some("y" | "yes") => ResumeRequest::approve(),
        Some("a" | "always") => ResumeRequest::approve_session(),
        _ => ResumeRequest::reject(None),
    }
}

fn is_yes(answer: Option<&str>) -> bool {
    matches!(answer.map(str::to_ascii_lowercase).as_deref(), Some("y" | "yes"))
}

fn continue_decision(answer: Option<&str>) -> ResumeRequest {
    if is_yes(answer) {
        ResumeRequest::approve()
    } else {
        ResumeRequest::reject(None)
    }
}

/// Blank declines; otherwise the answer must be a JSON value.
fn form_decision(answer: Option<&str>) -> (ElicitationAction, Option<Value>) {
    match answer.filter(|a| !a.is_empty()) {
        None => (ElicitationAction::Decline, None),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(content) => (ElicitationAction::Accept, Some(content)),
            Err(e) => {
                eprintln!("Invalid JSON ({e}), declining.");
                (ElicitationAction::Decline, None)
            }
        },
    }
}

/// Runs one turn on `runtime`, answering suspensions through `prompter`.
///
/// Ctrl+C cancels the turn and yields [`InterruptedError`]. A turn that
/// reported an error event fails with that message.
pub async fn run_turn<R: AsyncRead + Unpin>(
    runtime: &dyn Runtime,
    session: SharedSession,
    prompter: &mut Prompter<R>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let bridge = interrupt::cancel_on_interrupt(cancel.clone());
    let mut renderer = ExecRenderer::stdio();
    let mut last_error = None;

    let mut rx = runtime.run_stream(cancel.clone(), session);
    while let Some(event) = rx.recv().await {
        renderer.handle_event(&event);
        let resumed = match &event {
            Event::ToolCallConfirmation { tool_call, .. } => {
                let question = format!("Run {}? [y]es / [a]lways / [n]o: ", describe_call(tool_call));
                let answer = prompter.ask(&cancel, &question).await;
                runtime.resume(confirmation_decision(answer.as_deref())).await
            }
            Event::MaxIterationsReached { max_iterations } => {
                let question = format!("Reached {max_iterations} iterations. Continue? [y/N]: ");
                let answer = prompter.ask(&cancel, &question).await;
                runtime.resume(continue_decision(answer.as_deref())).await
            }
            Event::ElicitationRequest {
                message, mode, url, ..
            } => {
                eprintln!("{message}");
                let (action, content) = match mode {
                    ElicitationMode::Url => {
                        if let Some(url) = url {
                            eprintln!("Open: {url}");
                        }
                        let answer = prompter.ask(&cancel, "Accept? [y/N]: ").await;
                        if is_yes(answer.as_deref()) {
                            (ElicitationAction::Accept, None)
                        } else {
                            (ElicitationAction::Decline, None)
                        }
                    }
                    ElicitationMode::Form => {
                        let answer = prompter.ask(&cancel, "Response as JSON (blank to decline): ").await;
                        form_decision(answer.as_deref())
                    }
                };
                runtime.resume_elicitation(action, content).await
            }
            Event::Error { message, .. } => {
                last_error = Some(message.clone());
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = resumed
            && !cancel.is_cancelled()
        {
            tracing::warn!("resume failed: {e:#}");
        }
    }
    bridge.abort();

    if cancel.is_cancelled() {
        return Err(InterruptedError.into());
    }
    match last_error {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use troupe_core::core::resume::ResumeType;
    use troupe_core::tools::ToolDefinition;

    use super::*;

    fn render(events: &[Event]) -> (String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        {
            let mut renderer = ExecRenderer::new(&mut out, &mut err);
            for event in events {
                renderer.handle_event(event);
            }
        }
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    #[test]
    fn test_text_goes_to_stdout_and_tools_to_stderr() {
        let call = ToolCall::new("c1", "shell", r#"{"cmd":"ls"}"#);
        let (out, err) = render(&[
            Event::AgentChoice {
                agent_name: "root".into(),
                content: "Listing".into(),
            },
            Event::ToolCall {
                agent_name: "root".into(),
                tool_call: call.clone(),
                tool_definition: ToolDefinition::new("shell", "", serde_json::json!({})),
            },
            Event::ToolCallResponse {
                agent_name: "root".into(),
                tool_call: call,
                response: "permission denied\nmore".into(),
                is_error: true,
            },
            Event::AgentChoice {
                agent_name: "root".into(),
                content: "Done".into(),
            },
            Event::StreamStopped {
                session_id: "s".into(),
                agent_name: "root".into(),
            },
        ]);
        assert_eq!(out, "Listing\nDone\n");
        assert_eq!(err, "⚙ shell({\"cmd\":\"ls\"})\n✗ shell: permission denied\n");
    }

    #[test]
    fn test_long_arguments_are_truncated() {
        let call = ToolCall::new("c1", "write", "x".repeat(500));
        let described = describe_call(&call);
        assert!(described.ends_with("…)"));
        assert!(described.len() < 200);
    }

    #[test]
    fn test_confirmation_answers() {
        assert_eq!(confirmation_decision(Some("y")).resume_type, ResumeType::Approve);
        assert_eq!(confirmation_decision(Some("A")).resume_type, ResumeType::ApproveSession);
        assert_eq!(confirmation_decision(Some("n")).resume_type, ResumeType::Reject);
        assert_eq!(confirmation_decision(None).resume_type, ResumeType::Reject);
        assert_eq!(continue_decision(Some("")).resume_type, ResumeType::Reject);
    }

    #[test]
    fn test_form_answers() {
        assert_eq!(form_decision(Some("")), (ElicitationAction::Decline, None));
        assert_eq!(
            form_decision(Some(r#"{"name":"x"}"#)),
            (ElicitationAction::Accept, Some(serde_json::json!({"name": "x"})))
        );
        assert_eq!(form_decision(Some("{oops")).0, ElicitationAction::Decline);
    }

    #[tokio::test]
    async fn test_prompter_reads_lines_then_eof() {
        let mut prompter = Prompter::new(&b"  y \n"[..]);
        let cancel = CancellationToken::new();
        assert_eq!(prompter.ask(&cancel, "").await.as_deref(), Some("y"));
        assert_eq!(prompter.ask(&cancel, "").await, None);
    }
}
