//! Conversational state.
//!
//! A [`Session`] is the unit the loop reads and mutates: an ordered item log
//! (messages, summaries, sub-sessions), token counters, approval flags and
//! per-agent model overrides. Persistence goes through a [`SessionStore`];
//! a session is only written once it holds content.

mod file_store;
mod store;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

pub use file_store::JsonFileSessionStore;
pub use store::{
    InMemorySessionStore, SessionStore, SessionSummary, StoreError, persist_if_needed,
    resolve_session_id,
};

use crate::providers::Usage;
use crate::tools::ToolCall;

/// A session shared between the caller and the runtime driving it.
pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            agent_name: None,
            model: None,
            usage: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(agent_name: &str, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.agent_name = Some(agent_name.to_string());
        msg
    }

    pub fn tool_result(agent_name: &str, tool_call_id: &str, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.agent_name = Some(agent_name.to_string());
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg
    }
}

/// One entry of the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Item {
    Message { message: Message },
    Summary { summary: String },
    SubSession { session: Box<Session> },
}

/// Options copied into a freshly created session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTemplate {
    /// Requested id; a new one is generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub tools_approved: bool,
    pub hide_tool_results: bool,
    pub max_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub agent_model_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<Item>,
    /// Once set, tool calls skip confirmation for the rest of the session.
    #[serde(default)]
    pub tools_approved: bool,
    /// Presentation hint for drivers; the loop ignores it.
    #[serde(default)]
    pub hide_tool_results: bool,
    /// Iteration budget for one turn. Zero defers to the agent's budget.
    #[serde(default)]
    pub max_iterations: u32,
    /// Agent name to model reference, set by the model switcher.
    #[serde(default)]
    pub agent_model_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens the last model call saw, used to decide on compaction.
    #[serde(default)]
    pub context_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Whether a store already holds this session.
    #[serde(skip)]
    pub persisted: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: generate_session_id(),
            title: String::new(),
            created_at: Utc::now(),
            items: Vec::new(),
            tools_approved: false,
            hide_tool_results: false,
            max_iterations: 0,
            agent_model_overrides: BTreeMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            context_length: 0,
            working_dir: None,
            parent_id: None,
            persisted: false,
        }
    }

    /// Creates a session with the options of `template`.
    pub fn from_template(template: &SessionTemplate) -> Self {
        let mut session = Self::new();
        if let Some(id) = template.id.as_deref().filter(|id| !id.trim().is_empty()) {
            session.id = id.to_string();
        }
        session.title.clone_from(&template.title);
        session.tools_approved = template.tools_approved;
        session.hide_tool_results = template.hide_tool_results;
        session.max_iterations = template.max_iterations;
        session.working_dir.clone_from(&template.working_dir);
        session
            .agent_model_overrides
            .clone_from(&template.agent_model_overrides);
        session
    }

    /// Template that recreates this session's options (and id) elsewhere.
    pub fn template(&self) -> SessionTemplate {
        SessionTemplate {
            id: Some(self.id.clone()),
            title: self.title.clone(),
            tools_approved: self.tools_approved,
            hide_tool_results: self.hide_tool_results,
            max_iterations: self.max_iterations,
            working_dir: self.working_dir.clone(),
            agent_model_overrides: self.agent_model_overrides.clone(),
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn has_content(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn add_message(&mut self, message: Message) {
        self.items.push(Item::Message { message });
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.add_message(Message::user(content));
    }

    /// Adds a user message whose text files are inlined as content parts.
    ///
    /// Relative paths resolve against the session's working directory.
    pub fn add_user_message_with_attachments(
        &mut self,
        content: &str,
        attachments: &[PathBuf],
    ) -> Result<()> {
        let mut text = content.to_string();
        for path in attachments {
            let resolved = match &self.working_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            };
            let body = std::fs::read_to_string(&resolved)
                .with_context(|| format!("reading attachment {}", resolved.display()))?;
            let _ = write!(
                text,
                "\n\n<attachment path=\"{}\">\n{}\n</attachment>",
                path.display(),
                body.trim_end()
            );
        }
        self.add_user_message(text);
        Ok(())
    }

    pub fn add_summary(&mut self, summary: impl Into<String>) {
        self.items.push(Item::Summary {
            summary: summary.into(),
        });
    }

    pub fn add_sub_session(&mut self, session: Session) {
        self.items.push(Item::SubSession {
            session: Box::new(session),
        });
    }

    /// Top-level messages in order.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.items.iter().filter_map(|item| match item {
            Item::Message { message } => Some(message),
            _ => None,
        })
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages().last()
    }

    pub fn first_user_message(&self) -> Option<&Message> {
        self.messages().find(|m| m.role == Role::User)
    }

    /// The user messages after the last non-user item: the pending input of a turn.
    pub fn trailing_user_messages(&self) -> Vec<&Message> {
        let mut trailing: Vec<&Message> = self
            .items
            .iter()
            .rev()
            .map_while(|item| match item {
                Item::Message { message } if message.role == Role::User => Some(message),
                _ => None,
            })
            .collect();
        trailing.reverse();
        trailing
    }

    pub fn latest_summary(&self) -> Option<&str> {
        self.items.iter().rev().find_map(|item| match item {
            Item::Summary { summary } => Some(summary.as_str()),
            _ => None,
        })
    }

    /// Builds the model history: system prompt, then the latest summary (if
    /// any) as a user message, then the messages after it. Sub-sessions are
    /// not part of the history.
    pub fn history(&self, system_prompt: &str) -> Vec<Message> {
        let mut out = Vec::new();
        if !system_prompt.is_empty() {
            out.push(Message::system(system_prompt));
        }

        let start = self
            .items
            .iter()
            .rposition(|item| matches!(item, Item::Summary { .. }));
        if let Some(idx) = start
            && let Item::Summary { summary } = &self.items[idx]
        {
            out.push(Message::user(format!("Session Summary: {summary}")));
        }

        let tail = start.map_or(0, |idx| idx + 1);
        out.extend(self.items[tail..].iter().filter_map(|item| match item {
            Item::Message { message } => Some(message.clone()),
            _ => None,
        }));
        out
    }

    /// Replaces the log with `summary` followed by up to `tail` recent
    /// messages. The kept tail never starts with a tool result.
    pub fn compact(&mut self, summary: impl Into<String>, tail: usize) {
        let messages: Vec<Message> = self.messages().cloned().collect();
        let mut start = messages.len().saturating_sub(tail);
        while start < messages.len() && messages[start].role == Role::Tool {
            start += 1;
        }

        let mut items = Vec::with_capacity(1 + messages.len() - start);
        items.push(Item::Summary {
            summary: summary.into(),
        });
        items.extend(
            messages
                .into_iter()
                .skip(start)
                .map(|message| Item::Message { message }),
        );
        self.items = items;
        self.context_length = 0;
    }

    /// Copies the items before `position` into a new, unpersisted session.
    ///
    /// # Errors
    /// Fails when `position` is past the end of the log.
    pub fn branch(&self, position: usize) -> Result<Session> {
        if position > self.items.len() {
            bail!("branch position {position} out of range");
        }
        let mut branch = Session::from_template(&SessionTemplate {
            id: None,
            ..self.template()
        });
        branch.items = self.items[..position].to_vec();
        branch.parent_id = Some(self.id.clone());
        branch.input_tokens = self.input_tokens;
        branch.output_tokens = self.output_tokens;
        Ok(branch)
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn working_dir(&self) -> &Path {
        self.working_dir.as_deref().unwrap_or_else(|| Path::new("."))
    }

    /// Summary row for listings.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            message_count: self.messages().count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call_message() -> Message {
        let mut msg = Message::assistant("root", "");
        msg.tool_calls = vec![ToolCall::new("c1", "add", "{}")];
        msg
    }

    #[test]
    fn test_template_options_are_copied() {
        let template = SessionTemplate {
            tools_approved: true,
            max_iterations: 7,
            working_dir: Some(PathBuf::from("/tmp")),
            ..SessionTemplate::default()
        };
        let session = Session::from_template(&template);
        assert!(session.tools_approved);
        assert_eq!(session.max_iterations, 7);
        assert_eq!(session.working_dir(), Path::new("/tmp"));
        assert!(!session.id.is_empty());
        assert!(!session.persisted);
    }

    #[test]
    fn test_history_uses_latest_summary() {
        let mut session = Session::new();
        session.add_user_message("old question");
        session.add_message(Message::assistant("root", "old answer"));
        session.add_summary("they talked about rust");
        session.add_user_message("new question");

        let history = session.history("be helpful");
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::User]);
        assert_eq!(history[1].content, "Session Summary: they talked about rust");
        assert_eq!(history[2].content, "new question");
    }

    #[test]
    fn test_compact_keeps_tail_without_orphan_tool_result() {
        let mut session = Session::new();
        session.add_user_message("q1");
        session.add_message(tool_call_message());
        session.add_message(Message::tool_result("root", "c1", "4"));
        session.add_message(Message::assistant("root", "a1"));

        session.compact("summary", 2);
        assert_eq!(session.latest_summary(), Some("summary"));
        let contents: Vec<&str> = session.messages().map(|m| m.content.as_str()).collect();
        // The tail of two would start at the tool result, so it is trimmed.
        assert_eq!(contents, vec!["a1"]);
    }

    #[test]
    fn test_trailing_user_messages() {
        let mut session = Session::new();
        session.add_user_message("a");
        session.add_message(Message::assistant("root", "b"));
        session.add_user_message("c");
        session.add_user_message("d");
        let trailing: Vec<&str> = session
            .trailing_user_messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(trailing, vec!["c", "d"]);
    }

    #[test]
    fn test_branch_copies_prefix() {
        let mut session = Session::new();
        session.tools_approved = true;
        session.add_user_message("a");
        session.add_message(Message::assistant("root", "b"));

        let branch = session.branch(1).unwrap();
        assert_ne!(branch.id, session.id);
        assert_eq!(branch.parent_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(branch.items.len(), 1);
        assert!(branch.tools_approved);

        let err = session.branch(3).unwrap_err();
        assert_eq!(err.to_string(), "branch position 3 out of range");
    }

    #[test]
    fn test_attachments_are_inlined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "remember the milk\n").unwrap();
        let mut session = Session::new();
        session.working_dir = Some(dir.path().to_path_buf());

        session
            .add_user_message_with_attachments("see file", &[PathBuf::from("notes.txt")])
            .unwrap();
        let msg = session.last_message().unwrap();
        assert!(msg.content.starts_with("see file"));
        assert!(msg.content.contains("<attachment path=\"notes.txt\">"));
        assert!(msg.content.contains("remember the milk"));

        assert!(
            session
                .add_user_message_with_attachments("x", &[PathBuf::from("missing.txt")])
                .is_err()
        );
    }

    #[test]
    fn test_persisted_flag_is_not_serialized() {
        let mut session = Session::new();
        session.persisted = true;
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("persisted"));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert!(!back.persisted);
    }
}
