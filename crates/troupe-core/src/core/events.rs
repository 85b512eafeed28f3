//! Runtime event types.
//!
//! This module defines the contract for events emitted by a runtime turn.
//! Events are serializable so the remote transport can carry them verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::providers::ProviderErrorKind;
use crate::session::Message;
use crate::tools::{ElicitationAction, ToolCall, ToolDefinition};

/// Sender half of a turn's event stream.
pub type EventTx = mpsc::Sender<Event>;

/// Receiver half of a turn's event stream. The channel closes when the turn ends.
pub type EventRx = mpsc::Receiver<Event>;

/// Default capacity for event channels.
///
/// Senders await when the channel is full, so a slow consumer applies
/// backpressure to the loop instead of losing events.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (EventTx, EventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Events emitted by a runtime during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The pending user message that starts this turn.
    UserMessage { session_id: String, message: String },

    /// Turn has started processing.
    StreamStarted {
        session_id: String,
        agent_name: String,
    },

    /// Turn has finished. Always the last event before the channel closes.
    StreamStopped {
        session_id: String,
        agent_name: String,
    },

    /// The agent currently driving the turn.
    AgentInfo {
        agent_name: String,
        model: String,
        description: String,
    },

    /// The agents of the team and which one is active.
    TeamInfo {
        available_agents: Vec<AgentDetails>,
        current_agent: String,
    },

    /// Incremental assistant text.
    AgentChoice { agent_name: String, content: String },

    /// Incremental reasoning text, kept apart from visible output.
    AgentChoiceReasoning { agent_name: String, content: String },

    /// Tool call arguments as they stream in.
    PartialToolCall {
        agent_name: String,
        tool_call: ToolCall,
    },

    /// A tool invocation has been decided and is about to run.
    ToolCall {
        agent_name: String,
        tool_call: ToolCall,
        tool_definition: ToolDefinition,
    },

    /// The loop is suspended until the caller approves or rejects this call.
    ToolCallConfirmation {
        agent_name: String,
        tool_call: ToolCall,
        tool_definition: ToolDefinition,
    },

    /// A tool call has completed (or was declined).
    ToolCallResponse {
        agent_name: String,
        tool_call: ToolCall,
        response: String,
        is_error: bool,
    },

    /// The loop hit its iteration budget and is suspended.
    MaxIterationsReached { max_iterations: u32 },

    /// A tool needs out-of-band input or authorization; the loop is suspended.
    ElicitationRequest {
        agent_name: String,
        message: String,
        mode: ElicitationMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        elicitation_id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        meta: Value,
    },

    /// Outcome of a URL-mode elicitation.
    Authorization {
        agent_name: String,
        action: ElicitationAction,
    },

    /// Token usage after a model call.
    TokenUsage {
        agent_name: String,
        session_id: String,
        input_tokens: u64,
        output_tokens: u64,
        context_length: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_limit: Option<u64>,
    },

    /// A message was appended to the session.
    MessageAdded {
        agent_name: String,
        session_id: String,
        message: Message,
    },

    /// The session received a generated title.
    SessionTitle { session_id: String, title: String },

    /// Summarization produced a summary.
    SessionSummary {
        agent_name: String,
        session_id: String,
        summary: String,
    },

    /// Compaction progress.
    SessionCompaction {
        agent_name: String,
        session_id: String,
        status: CompactionStatus,
    },

    /// A task transfer to another agent started (`switching = true`) or ended.
    AgentSwitching {
        switching: bool,
        from_agent: String,
        to_agent: String,
    },

    /// Non-fatal condition worth surfacing.
    Warning { agent_name: String, message: String },

    /// An error occurred during execution.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        /// Error category for structured handling
        kind: ErrorKind,
        message: String,
    },
}

impl Event {
    /// Returns true for events after which the loop waits for a resume call.
    pub fn is_suspend(&self) -> bool {
        matches!(
            self,
            Event::ToolCallConfirmation { .. }
                | Event::MaxIterationsReached { .. }
                | Event::ElicitationRequest { .. }
        )
    }

    /// The serialized `type` tag of this event.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::UserMessage { .. } => "user_message",
            Event::StreamStarted { .. } => "stream_started",
            Event::StreamStopped { .. } => "stream_stopped",
            Event::AgentInfo { .. } => "agent_info",
            Event::TeamInfo { .. } => "team_info",
            Event::AgentChoice { .. } => "agent_choice",
            Event::AgentChoiceReasoning { .. } => "agent_choice_reasoning",
            Event::PartialToolCall { .. } => "partial_tool_call",
            Event::ToolCall { .. } => "tool_call",
            Event::ToolCallConfirmation { .. } => "tool_call_confirmation",
            Event::ToolCallResponse { .. } => "tool_call_response",
            Event::MaxIterationsReached { .. } => "max_iterations_reached",
            Event::ElicitationRequest { .. } => "elicitation_request",
            Event::Authorization { .. } => "authorization",
            Event::TokenUsage { .. } => "token_usage",
            Event::MessageAdded { .. } => "message_added",
            Event::SessionTitle { .. } => "session_title",
            Event::SessionSummary { .. } => "session_summary",
            Event::SessionCompaction { .. } => "session_compaction",
            Event::AgentSwitching { .. } => "agent_switching",
            Event::Warning { .. } => "warning",
            Event::Error { .. } => "error",
        }
    }

    /// The agent that produced this event, when it carries one.
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Event::StreamStarted { agent_name, .. }
            | Event::StreamStopped { agent_name, .. }
            | Event::AgentInfo { agent_name, .. }
            | Event::AgentChoice { agent_name, .. }
            | Event::AgentChoiceReasoning { agent_name, .. }
            | Event::PartialToolCall { agent_name, .. }
            | Event::ToolCall { agent_name, .. }
            | Event::ToolCallConfirmation { agent_name, .. }
            | Event::ToolCallResponse { agent_name, .. }
            | Event::ElicitationRequest { agent_name, .. }
            | Event::Authorization { agent_name, .. }
            | Event::TokenUsage { agent_name, .. }
            | Event::MessageAdded { agent_name, .. }
            | Event::SessionSummary { agent_name, .. }
            | Event::SessionCompaction { agent_name, .. }
            | Event::Warning { agent_name, .. } => Some(agent_name),
            Event::TeamInfo { current_agent, .. } => Some(current_agent),
            Event::Error { agent_name, .. } => agent_name.as_deref(),
            Event::UserMessage { .. }
            | Event::MaxIterationsReached { .. }
            | Event::SessionTitle { .. }
            | Event::AgentSwitching { .. } => None,
        }
    }

    pub fn error(agent_name: Option<&str>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Event::Error {
            agent_name: agent_name.map(str::to_string),
            kind,
            message: message.into(),
        }
    }
}

/// Summary of a team member, as reported in `TeamInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDetails {
    pub name: String,
    pub description: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStatus {
    Started,
    Completed,
}

/// How the caller is expected to satisfy an elicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationMode {
    /// Structured input matching `schema`.
    #[default]
    Form,
    /// Visit `url` (for example an OAuth consent page) and then accept.
    Url,
}

/// Error categories for `Event::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection/request timeout
    Timeout,
    /// Response parsing failed
    Parse,
    /// API-level error from provider
    ApiError,
    /// The connection to a remote runtime failed or dropped
    Transport,
    /// Internal/unknown error
    Internal,
}

impl From<ProviderErrorKind> for ErrorKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::HttpStatus => ErrorKind::HttpStatus,
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
            ProviderErrorKind::Parse => ErrorKind::Parse,
            ProviderErrorKind::ApiError => ErrorKind::ApiError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::HttpStatus => write!(f, "http_status"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::ApiError => write!(f, "api_error"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Thin wrapper over the event channel used by the loop.
///
/// Sends never fail: once the receiver is gone the turn keeps mutating the
/// session but nobody observes the events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: EventTx,
}

impl EventSender {
    pub fn new(tx: EventTx) -> Self {
        Self { tx }
    }

    /// Reliable send: awaits delivery so event order and backpressure hold.
    pub async fn send(&self, ev: Event) {
        let _ = self.tx.send(ev).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiver has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_serializes_with_snake_case_tag() {
        let ev = Event::MaxIterationsReached { max_iterations: 3 };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value, json!({"type": "max_iterations_reached", "max_iterations": 3}));
        assert_eq!(ev.type_name(), "max_iterations_reached");
    }

    #[test]
    fn test_type_name_matches_serde_tag_for_every_variant() {
        let call = ToolCall::new("call_1", "add", r#"{"a":2,"b":2}"#);
        let def = ToolDefinition::new("add", "adds", json!({"type": "object"}));
        let events = vec![
            Event::UserMessage {
                session_id: "s".into(),
                message: "hi".into(),
            },
            Event::AgentChoice {
                agent_name: "root".into(),
                content: "4".into(),
            },
            Event::ToolCallConfirmation {
                agent_name: "root".into(),
                tool_call: call.clone(),
                tool_definition: def.clone(),
            },
            Event::ToolCallResponse {
                agent_name: "root".into(),
                tool_call: call,
                response: "4".into(),
                is_error: false,
            },
            Event::SessionCompaction {
                agent_name: "root".into(),
                session_id: "s".into(),
                status: CompactionStatus::Started,
            },
            Event::error(Some("root"), ErrorKind::Transport, "boom"),
        ];
        for ev in events {
            let value = serde_json::to_value(&ev).unwrap();
            assert_eq!(value["type"], ev.type_name());
            let back: Event = serde_json::from_value(value).unwrap();
            assert_eq!(back, ev);
        }
    }

    #[test]
    fn test_only_confirmation_iteration_and_elicitation_suspend() {
        assert!(Event::MaxIterationsReached { max_iterations: 1 }.is_suspend());
        assert!(
            Event::ElicitationRequest {
                agent_name: "root".into(),
                message: "login".into(),
                mode: ElicitationMode::Url,
                schema: None,
                url: Some("https://example.com".into()),
                elicitation_id: "e1".into(),
                meta: Value::Null,
            }
            .is_suspend()
        );
        assert!(!Event::error(None, ErrorKind::Internal, "x").is_suspend());
    }

    #[test]
    fn test_error_kind_from_provider_kind() {
        assert_eq!(ErrorKind::from(ProviderErrorKind::Timeout), ErrorKind::Timeout);
        assert_eq!(ErrorKind::Transport.to_string(), "transport");
    }
}
