//! Tools and tool sets.
//!
//! A [`ToolSet`] is an external collaborator: the runtime only calls
//! `tools`, `start` and the handlers of the returned [`Tool`]s. The runtime
//! starts a set the first time a turn needs it; `stop` belongs to whoever
//! loaded the team.

pub mod read_file;
pub mod shell;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::events::ElicitationMode;
use crate::runtime::elicitation::ElicitationHandle;

/// Tool definition as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: ToolAnnotations,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolAnnotations {
    /// Pre-approved: calls never wait for confirmation.
    pub read_only_hint: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            annotations: ToolAnnotations::default(),
        }
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.annotations.read_only_hint = true;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.annotations.read_only_hint
    }
}

/// A tool invocation decided by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parses the arguments, treating an empty string as `{}`.
    pub fn parse_arguments<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = if self.arguments.trim().is_empty() {
            "{}"
        } else {
            self.arguments.as_str()
        };
        serde_json::from_str(raw)
            .with_context(|| format!("invalid arguments for tool '{}'", self.name))
    }
}

/// Output of a tool handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Context for tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Directory tool file operations resolve against.
    pub working_dir: PathBuf,
    /// Cancelled when the turn is cancelled.
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
    /// Present when the tool runs inside a runtime turn.
    pub elicitation: Option<ElicitationHandle>,
}

impl ToolContext {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            cancel: CancellationToken::new(),
            timeout: None,
            elicitation: None,
        }
    }

    /// Asks the caller for input through the runtime's elicitation protocol.
    ///
    /// # Errors
    /// Fails when the tool does not run inside a runtime turn.
    pub async fn elicit(&self, request: ElicitationRequest) -> Result<ElicitationResponse> {
        let handle = self
            .elicitation
            .as_ref()
            .context("elicitation is not available outside a runtime turn")?;
        handle.elicit(request).await
    }
}

/// Async tool handler function.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolCallResult>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(ToolCall, ToolContext) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
pub struct Tool {
    pub definition: ToolDefinition,
    pub handler: ToolHandler,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl Tool {
    pub fn new<F, Fut>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(ToolCall, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolCallResult>> + Send + 'static,
    {
        Self {
            definition,
            handler: Arc::new(move |call, ctx| Box::pin(handler(call, ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// A source of tools with a start/stop lifecycle.
#[async_trait]
pub trait ToolSet: Send + Sync {
    async fn tools(&self) -> Result<Vec<Tool>>;

    /// Extra system instructions contributed by this tool set.
    fn instructions(&self) -> Option<String> {
        None
    }

    /// Fails with [`AuthorizationRequired`] when the set needs the user to
    /// authorize access first.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Tool set backed by an in-process list of tools.
#[derive(Debug, Clone, Default)]
pub struct StaticToolSet {
    tools: Vec<Tool>,
    instructions: Option<String>,
}

impl StaticToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Adds `tool`, replacing any tool with the same name.
    pub fn register(&mut self, tool: Tool) {
        self.tools
            .retain(|t| !t.definition.name.eq_ignore_ascii_case(&tool.definition.name));
        self.tools.push(tool);
    }
}

#[async_trait]
impl ToolSet for StaticToolSet {
    async fn tools(&self) -> Result<Vec<Tool>> {
        Ok(self.tools.clone())
    }

    fn instructions(&self) -> Option<String> {
        self.instructions.clone()
    }
}

/// Returns a built-in tool set by config name.
pub fn builtin_tool_set(name: &str) -> Option<Arc<dyn ToolSet>> {
    match name {
        "read_file" => Some(Arc::new(StaticToolSet::new().with_tool(read_file::tool()))),
        "shell" => Some(Arc::new(StaticToolSet::new().with_tool(shell::tool()))),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationAction {
    Accept,
    Decline,
    Cancel,
}

impl fmt::Display for ElicitationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElicitationAction::Accept => write!(f, "accept"),
            ElicitationAction::Decline => write!(f, "decline"),
            ElicitationAction::Cancel => write!(f, "cancel"),
        }
    }
}

/// A request for out-of-band input raised by a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElicitationRequest {
    pub message: String,
    #[serde(default)]
    pub mode: ElicitationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationResponse {
    pub action: ElicitationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl ElicitationResponse {
    pub fn new(action: ElicitationAction) -> Self {
        Self {
            action,
            content: None,
        }
    }
}

/// Returned by [`ToolSet::start`] when the user must authorize access at `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequired {
    pub url: String,
    pub message: String,
}

impl fmt::Display for AuthorizationRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authorization required: {} ({})", self.message, self.url)
    }
}

impl std::error::Error for AuthorizationRequired {}
