//! Request and response bodies shared by the server and the client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::events::Event;
use crate::session::{Item, Role, SessionTemplate};
use crate::tools::ElicitationAction;

pub const SESSIONS_PATH: &str = "/api/sessions";

pub fn session_path(id: &str) -> String {
    format!("{SESSIONS_PATH}/{id}")
}

pub fn agent_path(id: &str, agent: &str) -> String {
    format!("{SESSIONS_PATH}/{id}/agent/{agent}")
}

/// A message sent along with a turn. Only user messages are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    #[serde(default = "default_role")]
    pub role: Role,
    pub content: String,
}

fn default_role() -> Role {
    Role::User
}

impl ApiMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/sessions`: a template plus an optional history to
/// start from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionBody {
    #[serde(flatten)]
    pub template: SessionTemplate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,
}

impl From<SessionTemplate> for CreateSessionBody {
    fn from(template: SessionTemplate) -> Self {
        Self {
            template,
            items: Vec::new(),
        }
    }
}

/// Body of `PATCH /api/sessions/{id}`. Absent fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptionsBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// Body of `POST /api/sessions/{id}/elicitation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationBody {
    pub action: ElicitationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// Body of `POST /api/sessions/{id}/summarize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Body of `POST /api/sessions/{id}/model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBody {
    pub agent: String,
    /// Empty clears the override.
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Frames an event as one SSE `data:` record.
pub fn encode_sse(event: &Event) -> Bytes {
    match serde_json::to_string(event) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(e) => {
            tracing::warn!(event = event.type_name(), "failed to serialize event: {e}");
            Bytes::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sse_frames_tagged_json() {
        let frame = encode_sse(&Event::Warning {
            agent_name: "root".to_string(),
            message: "careful".to_string(),
        });
        assert_eq!(
            frame,
            Bytes::from("data: {\"type\":\"warning\",\"agent_name\":\"root\",\"message\":\"careful\"}\n\n")
        );
    }

    #[test]
    fn test_api_message_defaults_to_user() {
        let message: ApiMessage = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(message, ApiMessage::user("hi"));
    }
}
