//! Session title generation.

use tokio_util::sync::CancellationToken;

use super::local::{LocalRuntime, last_assistant_content};
use super::{Runtime, collect_events};
use crate::core::events::{Event, EventSender};
use crate::session::{Role, Session, SharedSession};
use crate::team::{Agent, Team};

pub(super) const TITLE_SYSTEM_PROMPT: &str = "You are a helpful AI assistant that generates concise, descriptive titles for conversations. You will be given a conversation history and asked to create a single-line title that captures the main topic. Never use newlines or line breaks in your response.";

const MAX_TITLE_CHARS: usize = 50;

fn title_prompt(first_user_message: &str) -> String {
    format!(
        "Based on the following message a user sent to an AI assistant, generate a short, descriptive title (maximum {MAX_TITLE_CHARS} characters) that captures the main topic or purpose of the conversation. Return ONLY the title text on a single line, nothing else. Do not include any newlines, explanations, or formatting.\n\nUser message: {first_user_message}\n\n"
    )
}

/// First non-empty line, without control characters, capped at 50 chars.
fn sanitize_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let clean: String = line
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_TITLE_CHARS)
        .collect();
    let clean = clean.trim().trim_matches('"').trim().to_string();
    (!clean.is_empty()).then_some(clean)
}

impl LocalRuntime {
    /// Titles an untitled session that has seen a model response.
    pub(super) async fn generate_title(&self, cancel: &CancellationToken, session: &SharedSession, events: &EventSender) {
        let (session_id, first_user_message) = {
            let s = session.lock().await;
            let answered = s.messages().any(|m| m.role == Role::Assistant);
            match s.first_user_message() {
                Some(first) if s.title.is_empty() && answered => (s.id.clone(), first.content.clone()),
                _ => return,
            }
        };

        let agent = self.current_agent_arc();
        let titler = Agent::new("root", self.model_for(&agent)).with_instruction(TITLE_SYSTEM_PROMPT);
        let runtime = match LocalRuntime::builder(Team::single(titler)).build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(session_id = %session_id, "failed to create title runtime: {e:#}");
                return;
            }
        };

        let mut title_session = Session::new();
        title_session.title = "Generating title...".to_string();
        title_session.add_user_message(title_prompt(&first_user_message));
        let title_session = title_session.into_shared();

        let title_events = collect_events(runtime.run_stream(cancel.clone(), title_session.clone())).await;
        if let Some(Event::Error { message, .. }) = title_events.iter().find(|e| matches!(e, Event::Error { .. })) {
            tracing::warn!(session_id = %session_id, "failed to generate session title: {message}");
            return;
        }

        let Some(title) = sanitize_title(&last_assistant_content(&*title_session.lock().await)) else {
            return;
        };
        session.lock().await.title.clone_from(&title);
        tracing::debug!(session_id = %session_id, %title, "session titled");
        events.send(Event::SessionTitle { session_id, title }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("\n  Rust lifetimes\nextra"), Some("Rust lifetimes".to_string()));
        assert_eq!(sanitize_title("\"Quoted\""), Some("Quoted".to_string()));
        assert_eq!(sanitize_title("   \n \n"), None);
        let long = "x".repeat(80);
        assert_eq!(sanitize_title(&long).unwrap().chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_title_prompt_embeds_message() {
        let prompt = title_prompt("how do I sort a Vec?");
        assert!(prompt.contains("User message: how do I sort a Vec?\n\n"));
        assert!(prompt.contains("maximum 50 characters"));
    }
}
