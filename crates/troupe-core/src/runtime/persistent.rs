//! A [`LocalRuntime`] that writes sessions to a [`SessionStore`] as the loop
//! mutates them.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{LocalRuntime, ResumeRequest, Runtime};
use crate::core::events::{Event, EventRx, EventSender, create_event_channel};
use crate::session::{SessionStore, SharedSession, persist_if_needed};
use crate::tools::ElicitationAction;

#[derive(Clone)]
pub struct PersistentRuntime {
    runtime: LocalRuntime,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for PersistentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRuntime")
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

/// Session id of events that follow a session mutation worth saving.
fn mutation_session_id(event: &Event) -> Option<&str> {
    match event {
        Event::StreamStarted { session_id, .. }
        | Event::StreamStopped { session_id, .. }
        | Event::MessageAdded { session_id, .. }
        | Event::SessionSummary { session_id, .. }
        | Event::SessionTitle { session_id, .. }
        | Event::TokenUsage { session_id, .. } => Some(session_id.as_str()),
        _ => None,
    }
}

/// Saves `session` if `event` reports a change to it. Failures are logged.
async fn persist_after(store: &dyn SessionStore, session: &SharedSession, event: &Event) {
    let Some(id) = mutation_session_id(event) else {
        return;
    };
    let mut snapshot = {
        let s = session.lock().await;
        if s.id != id {
            return;
        }
        s.clone()
    };
    match persist_if_needed(store, &mut snapshot).await {
        Ok(true) => {
            session.lock().await.persisted = true;
            tracing::trace!(session_id = %snapshot.id, event = event.type_name(), "session saved");
        }
        Ok(false) => {}
        Err(e) => tracing::error!(session_id = %snapshot.id, "failed to persist session: {e:#}"),
    }
}

impl PersistentRuntime {
    pub fn new(runtime: LocalRuntime, store: Arc<dyn SessionStore>) -> Self {
        Self { runtime, store }
    }

    pub fn local(&self) -> &LocalRuntime {
        &self.runtime
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Sets the override and saves the session if it already has content.
    ///
    /// # Errors
    /// See [`LocalRuntime::set_agent_model`]; store failures also surface.
    pub async fn set_agent_model(&self, session: &SharedSession, agent_name: &str, reference: &str) -> Result<()> {
        self.runtime.set_agent_model(session, agent_name, reference).await?;
        let mut snapshot = session.lock().await.clone();
        if persist_if_needed(self.store.as_ref(), &mut snapshot).await? {
            session.lock().await.persisted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl Runtime for PersistentRuntime {
    fn current_agent(&self) -> String {
        self.runtime.current_agent()
    }

    /// The loop keeps running and saving after the receiver is dropped,
    /// but a suspension nobody can answer cancels the turn.
    fn run_stream(&self, cancel: CancellationToken, session: SharedSession) -> EventRx {
        let turn = cancel.child_token();
        let mut source = self.runtime.run_stream(turn.clone(), Arc::clone(&session));
        let (tx, rx) = create_event_channel();
        let events = EventSender::new(tx);
        let store = Arc::clone(&self.store);
        let local = self.runtime.clone();

        tokio::spawn(async move {
            let mut watching = true;
            loop {
                let next = tokio::select! {
                    next = source.recv() => next,
                    () = events.closed(), if watching => {
                        watching = false;
                        if local.pending_suspension().is_some() {
                            tracing::debug!("receiver dropped while suspended, cancelling turn");
                            turn.cancel();
                        }
                        continue;
                    }
                };
                let Some(event) = next else { break };
                persist_after(store.as_ref(), &session, &event).await;
                if !events.is_closed() {
                    events.send(event).await;
                } else if event.is_suspend() {
                    tracing::debug!(event = event.type_name(), "suspended with no receiver, cancelling turn");
                    turn.cancel();
                }
            }
        });
        rx
    }

    async fn resume(&self, request: ResumeRequest) -> Result<()> {
        self.runtime.resume(request).await
    }

    async fn resume_elicitation(&self, action: ElicitationAction, content: Option<Value>) -> Result<()> {
        self.runtime.resume_elicitation(action, content).await
    }

    async fn summarize(
        &self,
        cancel: CancellationToken,
        session: SharedSession,
        additional_prompt: Option<String>,
        events: EventSender,
    ) {
        let (tx, mut rx) = create_event_channel();
        let run = self
            .runtime
            .summarize(cancel, Arc::clone(&session), additional_prompt, EventSender::new(tx));
        let forward = async {
            while let Some(event) = rx.recv().await {
                persist_after(self.store.as_ref(), &session, &event).await;
                events.send(event).await;
            }
        };
        tokio::join!(run, forward);
    }

    async fn close(&self) -> Result<()> {
        self.runtime.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::providers::{ProviderError, ScriptedProvider};
    use crate::runtime::collect_events;
    use crate::session::{InMemorySessionStore, Role, Session};
    use crate::team::{Agent, Team};
    use crate::tools::{StaticToolSet, Tool, ToolCallResult, ToolDefinition};

    fn runtime(model: ScriptedProvider) -> (PersistentRuntime, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let local = LocalRuntime::builder(Team::single(Agent::new("root", Arc::new(model))))
            .build()
            .unwrap();
        (PersistentRuntime::new(local, store.clone()), store)
    }

    /// Verifies a completed turn is written with its messages and tokens.
    #[tokio::test]
    async fn test_turn_is_persisted() {
        let (runtime, store) = runtime(ScriptedProvider::new("scripted/m").reply_text("4"));
        let mut session = Session::new();
        session.add_user_message("2+2?");
        let id = session.id.clone();
        let session = session.into_shared();

        let rx = runtime.run_stream(CancellationToken::new(), session.clone());
        timeout(Duration::from_secs(5), collect_events(rx)).await.unwrap();

        let stored = store.get_session(&id).await.unwrap();
        assert_eq!(stored.messages().count(), 2);
        assert_eq!(stored.input_tokens, 10);
        assert!(session.lock().await.persisted);
    }

    /// Verifies an empty session is never written, even when the turn fails.
    #[tokio::test]
    async fn test_empty_session_stays_unpersisted() {
        let (runtime, store) = runtime(ScriptedProvider::new("scripted/m").fail(ProviderError::http_status(400, "")));
        let session = Session::new().into_shared();

        let rx = runtime.run_stream(CancellationToken::new(), session.clone());
        let events = timeout(Duration::from_secs(5), collect_events(rx)).await.unwrap();

        assert!(events.iter().any(|e| matches!(e, Event::Error { .. })));
        assert!(store.get_sessions().await.unwrap().is_empty());
        assert!(!session.lock().await.persisted);
    }

    /// Verifies dropping the receiver at a confirmation cancels the turn and
    /// still saves the cancelled call.
    #[tokio::test]
    async fn test_dropped_receiver_cancels_suspended_turn() {
        let noop = Tool::new(ToolDefinition::new("noop", "Does nothing", json!({"type": "object"})), |_call, _ctx| async {
            Ok(ToolCallResult::success(""))
        });
        let model = ScriptedProvider::new("scripted/m").reply_tool_call("noop", "{}");
        let agent = Agent::new("root", Arc::new(model)).with_toolset(Arc::new(StaticToolSet::new().with_tool(noop)));
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = PersistentRuntime::new(
            LocalRuntime::builder(Team::single(agent)).build().unwrap(),
            store.clone(),
        );
        let mut session = Session::new();
        session.add_user_message("run it");
        let id = session.id.clone();
        let session = session.into_shared();

        let mut rx = runtime.run_stream(CancellationToken::new(), session.clone());
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            if event.is_suspend() {
                break;
            }
        }
        drop(rx);
        timeout(Duration::from_secs(5), async {
            while runtime.local().is_busy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("turn did not end");

        assert_eq!(runtime.local().pending_suspension(), None);
        let stored = store.get_session(&id).await.unwrap();
        assert_eq!(stored.last_message().unwrap().role, Role::Tool);
    }

    /// Verifies the user message survives a failed model call.
    #[tokio::test]
    async fn test_user_message_saved_before_model_failure() {
        let (runtime, store) = runtime(ScriptedProvider::new("scripted/m").fail(ProviderError::http_status(400, "")));
        let mut session = Session::new();
        session.add_user_message("hello?");
        let id = session.id.clone();

        let rx = runtime.run_stream(CancellationToken::new(), session.into_shared());
        timeout(Duration::from_secs(5), collect_events(rx)).await.unwrap();

        let stored = store.get_session(&id).await.unwrap();
        assert_eq!(stored.messages().count(), 1);
    }
}
