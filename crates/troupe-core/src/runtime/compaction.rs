//! Session summarization and compaction.

use std::fmt::Write as _;

use tokio_util::sync::CancellationToken;

use super::local::{LocalRuntime, last_assistant_content};
use super::{Runtime, collect_events};
use crate::core::events::{CompactionStatus, Event, EventSender};
use crate::session::{Message, Role, Session, SharedSession};
use crate::team::{Agent, Team};

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a helpful AI assistant that creates comprehensive summaries of conversations. You will be given a conversation history and asked to create a concise yet thorough summary that captures the key points, decisions made, and outcomes.";

pub const SUMMARY_PROMPT: &str = "Based on the following conversation between a user and an AI assistant, create a comprehensive summary that captures:
- The main topics discussed
- Key information exchanged
- Decisions made or conclusions reached
- Important outcomes or results

Provide a well-structured summary (2-4 paragraphs) that someone could read to understand what happened in this conversation. Return ONLY the summary text, nothing else.

Conversation history:";

const EMPTY_SESSION_WARNING: &str = "Session is empty. Start a conversation before compacting.";

/// Renders the conversation as `\nUser: ...` / `\nAssistant: ...` lines.
fn render_conversation(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => continue,
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let _ = write!(out, "\n{role}: {}", message.content);
    }
    out
}

fn summary_prompt(conversation: &str, additional: Option<&str>) -> String {
    let mut prompt = format!("{SUMMARY_PROMPT}{conversation}\n\nGenerate a summary for this conversation:");
    if let Some(extra) = additional.map(str::trim).filter(|e| !e.is_empty()) {
        let _ = write!(prompt, "\n\nAdditional instructions from user: {extra}");
    }
    prompt
}

impl LocalRuntime {
    /// Summarizes with the current agent's model on a throwaway runtime,
    /// then compacts the session. The session is untouched on failure.
    pub(super) async fn compact_session(
        &self,
        cancel: &CancellationToken,
        session: &SharedSession,
        additional_prompt: Option<&str>,
        events: &EventSender,
    ) {
        let agent = self.current_agent_arc();
        let (session_id, messages) = {
            let s = session.lock().await;
            // The previous summary is part of what gets condensed.
            (s.id.clone(), s.history(""))
        };
        tracing::debug!(session_id = %session_id, "summarizing session");

        events
            .send(Event::SessionCompaction {
                agent_name: agent.name.clone(),
                session_id: session_id.clone(),
                status: CompactionStatus::Started,
            })
            .await;

        if messages.is_empty() {
            events
                .send(Event::Warning {
                    agent_name: agent.name.clone(),
                    message: EMPTY_SESSION_WARNING.to_string(),
                })
                .await;
        } else {
            let prompt = summary_prompt(&render_conversation(&messages), additional_prompt);
            match self.generate_summary(cancel, &agent, prompt).await {
                Ok(summary) if !summary.trim().is_empty() => {
                    let summary = summary.trim().to_string();
                    session
                        .lock()
                        .await
                        .compact(summary.clone(), self.inner.options.compaction_tail);
                    tracing::info!(session_id = %session_id, summary_len = summary.len(), "session compacted");
                    events
                        .send(Event::SessionSummary {
                            agent_name: agent.name.clone(),
                            session_id: session_id.clone(),
                            summary,
                        })
                        .await;
                }
                Ok(_) if cancel.is_cancelled() => {}
                Ok(_) => {
                    tracing::warn!(session_id = %session_id, "summarizer returned an empty summary");
                }
                Err(message) => {
                    tracing::error!(session_id = %session_id, "failed to generate session summary: {message}");
                    events
                        .send(Event::Warning {
                            agent_name: agent.name.clone(),
                            message: format!("Failed to generate session summary: {message}"),
                        })
                        .await;
                }
            }
        }

        events
            .send(Event::SessionCompaction {
                agent_name: agent.name.clone(),
                session_id,
                status: CompactionStatus::Completed,
            })
            .await;
    }

    async fn generate_summary(
        &self,
        cancel: &CancellationToken,
        agent: &Agent,
        prompt: String,
    ) -> Result<String, String> {
        let summarizer = Agent::new("root", self.model_for(agent)).with_instruction(SUMMARY_SYSTEM_PROMPT);
        let runtime = LocalRuntime::builder(Team::single(summarizer))
            .build()
            .map_err(|e| format!("{e:#}"))?;

        let mut summary_session = Session::new();
        summary_session.title = "Generating summary...".to_string();
        summary_session.add_user_message(prompt);
        let summary_session = summary_session.into_shared();

        let events = collect_events(runtime.run_stream(cancel.clone(), summary_session.clone())).await;
        if let Some(message) = events.iter().find_map(|e| match e {
            Event::Error { message, .. } => Some(message.clone()),
            _ => None,
        }) {
            return Err(message);
        }
        Ok(last_assistant_content(&*summary_session.lock().await))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::events::create_event_channel;
    use crate::providers::{ProviderError, ScriptedProvider};
    use crate::runtime::RuntimeOptions;
    use crate::session::Item;

    fn runtime(model: Arc<ScriptedProvider>, tail: usize) -> LocalRuntime {
        LocalRuntime::builder(Team::single(Agent::new("root", model)))
            .options(RuntimeOptions {
                compaction_tail: tail,
                ..RuntimeOptions::default()
            })
            .build()
            .unwrap()
    }

    async fn summarize(runtime: &LocalRuntime, session: &SharedSession, extra: Option<&str>) -> Vec<Event> {
        let (tx, rx) = create_event_channel();
        runtime
            .summarize(
                CancellationToken::new(),
                session.clone(),
                extra.map(str::to_string),
                EventSender::new(tx),
            )
            .await;
        collect_events(rx).await
    }

    #[test]
    fn test_render_skips_system_messages() {
        let rendered = render_conversation(&[
            Message::system("secret"),
            Message::user("hi"),
            Message::assistant("root", "hello"),
        ]);
        assert_eq!(rendered, "\nUser: hi\nAssistant: hello");
        assert!(summary_prompt("", Some("focus on code")).ends_with("Additional instructions from user: focus on code"));
    }

    /// Verifies a successful summary compacts to the summary plus the tail.
    #[tokio::test]
    async fn test_summarize_compacts_session() {
        let model = Arc::new(ScriptedProvider::new("scripted/m").reply_text("They discussed arithmetic."));
        let runtime = runtime(model.clone(), 2);

        let mut session = Session::new();
        for i in 0..3 {
            session.add_user_message(format!("q{i}"));
            session.add_message(Message::assistant("root", format!("a{i}")));
        }
        let session = session.into_shared();

        let events = summarize(&runtime, &session, Some("be brief")).await;
        let types: Vec<&str> = events.iter().map(Event::type_name).collect();
        assert_eq!(types, vec!["session_compaction", "session_summary", "session_compaction"]);

        let s = session.lock().await;
        assert_eq!(s.latest_summary(), Some("They discussed arithmetic."));
        assert!(matches!(s.items[0], Item::Summary { .. }));
        assert_eq!(s.messages().count(), 2);

        let request = &model.requests()[0];
        assert_eq!(request[0].content, SUMMARY_SYSTEM_PROMPT);
        assert!(request[1].content.contains("\nUser: q0\nAssistant: a0"));
        assert!(request[1].content.contains("Additional instructions from user: be brief"));
    }

    /// Verifies an empty session only warns.
    #[tokio::test]
    async fn test_empty_session_warns() {
        let model = Arc::new(ScriptedProvider::new("scripted/m"));
        let runtime = runtime(model.clone(), 2);
        let session = Session::new().into_shared();

        let events = summarize(&runtime, &session, None).await;
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Warning { message, .. } if message == EMPTY_SESSION_WARNING
        )));
        assert_eq!(model.calls(), 0);
        assert!(!session.lock().await.has_content());
    }

    /// Verifies a failing model leaves history untouched.
    #[tokio::test]
    async fn test_failed_summary_keeps_history() {
        let model = Arc::new(ScriptedProvider::new("scripted/m").fail(ProviderError::http_status(400, "")));
        let runtime = runtime(model, 2);
        let mut session = Session::new();
        session.add_user_message("q");
        session.add_message(Message::assistant("root", "a"));
        let before = session.items.clone();
        let session = session.into_shared();

        let events = summarize(&runtime, &session, None).await;
        assert!(!events.iter().any(|e| matches!(e, Event::SessionSummary { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::Warning { .. })));
        assert_eq!(session.lock().await.items, before);
    }
}
