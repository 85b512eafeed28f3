//! [`Runtime`] over the HTTP API.
//!
//! The local session stays the caller's view: the first turn uploads it,
//! each turn sends only the items the server does not hold yet, and remote
//! events are mirrored into it as they arrive. When a turn or summary ends
//! the local session is resynced from the server, which owns compaction and
//! sub-sessions.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::client::{RemoteClient, RemoteError, RemoteEventStream};
use super::wire::{ApiMessage, CreateSessionBody, SessionOptionsBody};
use crate::core::events::{CompactionStatus, ErrorKind, Event, EventRx, EventSender, create_event_channel};
use crate::core::resume::ResumeRequest;
use crate::runtime::Runtime;
use crate::session::{Item, Role, Session, SharedSession};
use crate::tools::ElicitationAction;

const DEFAULT_AGENT: &str = "root";
const STREAM_ENDED: &str = "remote stream ended unexpectedly";
const STREAM_FAILED: &str = "remote event stream failed";

/// What the server is known to hold of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Synced {
    /// Leading items of the local copy that the server already has.
    items: usize,
    tools_approved: bool,
    max_iterations: u32,
}

impl Synced {
    fn of(session: &Session) -> Self {
        Self {
            items: session.items.len(),
            tools_approved: session.tools_approved,
            max_iterations: session.max_iterations,
        }
    }
}

/// How a forwarded remote stream ended.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Finished,
    Cancelled,
    /// Closed or failed before its final event.
    Broken(String),
}

struct Inner {
    client: RemoteClient,
    current_agent: RwLock<String>,
    /// Session the last turn ran on; resume calls are routed to it.
    session_id: RwLock<Option<String>>,
    synced: Mutex<HashMap<String, Synced>>,
}

#[derive(Clone)]
pub struct RemoteRuntime {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RemoteRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRuntime")
            .field("base_url", &self.inner.client.base_url().as_str())
            .field("current_agent", &self.current_agent())
            .finish_non_exhaustive()
    }
}

fn is_status(err: &anyhow::Error, status: u16) -> bool {
    err.downcast_ref::<RemoteError>()
        .is_some_and(|e| e.status == Some(status))
}

/// The wire form of an item added locally. Only plain messages travel.
fn pending_message(item: &Item) -> Option<ApiMessage> {
    match item {
        Item::Message { message } if matches!(message.role, Role::User | Role::Assistant) => Some(ApiMessage {
            role: message.role,
            content: message.content.clone(),
        }),
        _ => {
            tracing::debug!("local item cannot be sent to the server, skipping");
            None
        }
    }
}

fn is_turn_end(event: &Event) -> bool {
    matches!(event, Event::StreamStopped { .. })
}

fn is_summary_end(event: &Event) -> bool {
    matches!(
        event,
        Event::SessionCompaction {
            status: CompactionStatus::Completed,
            ..
        } | Event::Error { .. }
    )
}

impl RemoteRuntime {
    pub fn new(client: RemoteClient) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                current_agent: RwLock::new(DEFAULT_AGENT.to_string()),
                session_id: RwLock::new(None),
                synced: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn with_current_agent(self, name: impl Into<String>) -> Self {
        self.set_current_agent(name);
        self
    }

    pub fn set_current_agent(&self, name: impl Into<String>) {
        *self
            .inner
            .current_agent
            .write()
            .unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn client(&self) -> &RemoteClient {
        &self.inner.client
    }

    fn remote_session_id(&self) -> Option<String> {
        self.inner
            .session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Creates the remote copy of `local`, or picks up the one that exists.
    async fn attach(&self, local: &Session) -> Result<Synced> {
        let history = local
            .items
            .len()
            .saturating_sub(local.trailing_user_messages().len());
        let body = CreateSessionBody {
            template: local.template(),
            items: local.items[..history].to_vec(),
        };
        match self.inner.client.create_session(body).await {
            Ok(created) => {
                tracing::debug!(session_id = %local.id, "remote session created");
                Ok(Synced::of(&created))
            }
            Err(e) if is_status(&e, 409) => {
                let remote = self.inner.client.get_session(&local.id).await?;
                tracing::debug!(session_id = %local.id, items = remote.items.len(), "remote session already exists");
                let mut synced = Synced::of(&remote);
                if !local.items.starts_with(&remote.items) {
                    tracing::warn!(session_id = %local.id, "local history diverged from the server, sending trailing messages only");
                    synced.items = history;
                }
                Ok(synced)
            }
            Err(e) => Err(e),
        }
    }

    /// Makes sure the server holds `session` with its current options.
    /// Returns the id and the messages the server does not have yet.
    async fn prepare(&self, session: &SharedSession) -> Result<(String, Vec<ApiMessage>)> {
        let local = session.lock().await.clone();
        let mut synced = self.inner.synced.lock().await;
        let mut state = match synced.get(&local.id) {
            Some(state) => *state,
            None => self.attach(&local).await?,
        };

        if (state.tools_approved, state.max_iterations) != (local.tools_approved, local.max_iterations) {
            let options = SessionOptionsBody {
                tools_approved: Some(local.tools_approved),
                max_iterations: Some(local.max_iterations),
            };
            let remote = self.inner.client.update_session(&local.id, options).await?;
            state.tools_approved = remote.tools_approved;
            state.max_iterations = remote.max_iterations;
        }
        synced.insert(local.id.clone(), state);
        drop(synced);

        *self
            .inner
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(local.id.clone());
        let pending = local
            .items
            .get(state.items..)
            .unwrap_or_default()
            .iter()
            .filter_map(pending_message)
            .collect();
        Ok((local.id, pending))
    }

    /// Records that the server appended `count` items the local copy has too.
    async fn advance(&self, id: &str, count: usize) {
        if let Some(state) = self.inner.synced.lock().await.get_mut(id) {
            state.items += count;
        }
    }

    /// Applies what `event` says about the session to the local copy.
    /// Events of sub-sessions only arrive with the final resync.
    async fn mirror(&self, session: &SharedSession, event: &Event) {
        match event {
            Event::MessageAdded {
                session_id, message, ..
            } => {
                let mut s = session.lock().await;
                if s.id == *session_id {
                    s.add_message(message.clone());
                    drop(s);
                    self.advance(session_id, 1).await;
                }
            }
            Event::TokenUsage {
                session_id,
                input_tokens,
                output_tokens,
                context_length,
                ..
            } => {
                let mut s = session.lock().await;
                if s.id == *session_id {
                    s.input_tokens = *input_tokens;
                    s.output_tokens = *output_tokens;
                    s.context_length = *context_length;
                }
            }
            Event::SessionTitle { session_id, title } => {
                let mut s = session.lock().await;
                if s.id == *session_id {
                    s.title.clone_from(title);
                }
            }
            Event::TeamInfo { current_agent, .. } => self.set_current_agent(current_agent.clone()),
            Event::StreamStopped { agent_name, .. } => self.set_current_agent(agent_name.clone()),
            _ => {}
        }
    }

    /// Replaces the local log and counters with the server's copy.
    async fn resync(&self, id: &str, session: &SharedSession) {
        match self.inner.client.get_session(id).await {
            Ok(remote) => {
                self.inner
                    .synced
                    .lock()
                    .await
                    .insert(id.to_string(), Synced::of(&remote));
                let mut s = session.lock().await;
                adopt(&mut s, remote);
                tracing::trace!(session_id = %id, "session resynced from server");
            }
            Err(e) => tracing::warn!(session_id = %id, "failed to resync session from server: {e:#}"),
        }
    }

    /// Forwards `stream` until `is_last` matches, resyncing before that
    /// final event goes out.
    async fn forward(
        &self,
        cancel: &CancellationToken,
        id: &str,
        session: &SharedSession,
        mut stream: RemoteEventStream,
        events: &EventSender,
        is_last: fn(&Event) -> bool,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(session_id = %id, "remote stream cancelled");
                    return StreamEnd::Cancelled;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    self.mirror(session, &event).await;
                    let last = is_last(&event);
                    if last {
                        self.resync(id, session).await;
                    }
                    events.send(event).await;
                    if last {
                        return StreamEnd::Finished;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %id, "remote event stream failed: {e}");
                    return StreamEnd::Broken(format!("{STREAM_FAILED}: {e}"));
                }
                None => return StreamEnd::Broken(STREAM_ENDED.to_string()),
            }
        }
    }

    async fn run_turn(&self, cancel: &CancellationToken, session: &SharedSession, events: &EventSender) {
        let started = async {
            let (id, pending) = self.prepare(session).await?;
            let agent = self.current_agent();
            tracing::info!(session_id = %id, agent = %agent, pending = pending.len(), "starting remote turn");
            let stream = self.inner.client.run_agent(&id, &agent, &pending).await?;
            self.advance(&id, pending.len()).await;
            anyhow::Ok((id, stream))
        };
        let (id, stream) = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            started = started => match started {
                Ok(started) => started,
                Err(e) => {
                    tracing::error!("failed to start remote agent: {e:#}");
                    events
                        .send(Event::error(
                            None,
                            ErrorKind::Transport,
                            format!("failed to start remote agent: {e:#}"),
                        ))
                        .await;
                    return;
                }
            },
        };

        if let StreamEnd::Broken(message) = self.forward(cancel, &id, session, stream, events, is_turn_end).await {
            events
                .send(Event::error(None, ErrorKind::Transport, message))
                .await;
        }
    }

    /// Sets an agent's model on the server and records the override locally.
    ///
    /// # Errors
    /// Fails when the server rejects the reference.
    pub async fn set_agent_model(&self, session: &SharedSession, agent_name: &str, reference: &str) -> Result<()> {
        let (id, _) = self.prepare(session).await?;
        let remote = self
            .inner
            .client
            .set_agent_model(&id, agent_name, reference)
            .await?;
        session.lock().await.agent_model_overrides = remote.agent_model_overrides;
        Ok(())
    }
}

/// Copies the server-owned state of `remote` into `local`.
fn adopt(local: &mut Session, remote: Session) {
    local.items = remote.items;
    local.title = remote.title;
    local.tools_approved = remote.tools_approved;
    local.max_iterations = remote.max_iterations;
    local.agent_model_overrides = remote.agent_model_overrides;
    local.input_tokens = remote.input_tokens;
    local.output_tokens = remote.output_tokens;
    local.context_length = remote.context_length;
}

#[async_trait]
impl Runtime for RemoteRuntime {
    fn current_agent(&self) -> String {
        self.inner
            .current_agent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run_stream(&self, cancel: CancellationToken, session: SharedSession) -> EventRx {
        let (tx, rx) = create_event_channel();
        let events = EventSender::new(tx);
        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.run_turn(&cancel, &session, &events).await;
        });
        rx
    }

    async fn resume(&self, request: ResumeRequest) -> Result<()> {
        let Some(id) = self.remote_session_id() else {
            bail!("no remote session to resume");
        };
        tracing::debug!(session_id = %id, confirmation = %request.resume_type, "resume remote");
        self.inner.client.resume_session(&id, &request).await
    }

    async fn resume_elicitation(&self, action: ElicitationAction, content: Option<Value>) -> Result<()> {
        let Some(id) = self.remote_session_id() else {
            bail!("no remote session to resume");
        };
        tracing::debug!(session_id = %id, %action, "resume remote elicitation");
        self.inner
            .client
            .resume_elicitation(&id, action, content)
            .await
    }

    async fn summarize(
        &self,
        cancel: CancellationToken,
        session: SharedSession,
        additional_prompt: Option<String>,
        events: EventSender,
    ) {
        let started = async {
            let (id, _) = self.prepare(&session).await?;
            let stream = self.inner.client.summarize(&id, additional_prompt).await?;
            anyhow::Ok((id, stream))
        };
        let (id, stream) = match started.await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!("failed to start remote summary: {e:#}");
                events
                    .send(Event::error(
                        None,
                        ErrorKind::Transport,
                        format!("failed to start remote summary: {e:#}"),
                    ))
                    .await;
                return;
            }
        };
        if let StreamEnd::Broken(message) = self
            .forward(&cancel, &id, &session, stream, &events, is_summary_end)
            .await
        {
            events
                .send(Event::error(None, ErrorKind::Transport, message))
                .await;
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::providers::{ModelProvider, ProviderError, ScriptedProvider};
    use crate::remote::server::RuntimeFactory;
    use crate::remote::server::tests::TestServer;
    use crate::runtime::{LocalRuntime, collect_events};
    use crate::session::{Item, Role, SessionStore};
    use crate::team::{Agent, Team};
    use crate::tools::{StaticToolSet, Tool, ToolCallResult, ToolDefinition};

    const WAIT: Duration = Duration::from_secs(10);

    fn add_tool() -> Tool {
        Tool::new(
            ToolDefinition::new("add", "Adds two numbers", json!({"type": "object"})),
            |call, _ctx| async move {
                let args: Value = call.parse_arguments()?;
                let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
                Ok(ToolCallResult::success(sum.to_string()))
            },
        )
    }

    fn scripted_runtime() -> Result<LocalRuntime> {
        let model = Arc::new(
            ScriptedProvider::new("scripted/m")
                .reply_tool_call("add", r#"{"a":2,"b":2}"#)
                .reply_text("2+2 is 4"),
        );
        let agent = Agent::new("root", model as Arc<dyn ModelProvider>)
            .with_toolset(Arc::new(StaticToolSet::new().with_tool(add_tool())));
        LocalRuntime::builder(Team::single(agent)).build()
    }

    fn session(prompt: &str) -> SharedSession {
        let mut session = Session::new();
        session.add_user_message(prompt);
        session.into_shared()
    }

    /// Messages of `session`, dropping summaries and sub-sessions.
    fn message_view(session: &Session) -> Vec<(Role, String)> {
        session
            .items
            .iter()
            .filter_map(|item| match item {
                Item::Message { message } => Some((message.role, message.content.clone())),
                _ => None,
            })
            .collect()
    }

    /// Drives one turn, approving the single confirmation.
    async fn drive(runtime: &dyn Runtime, session: &SharedSession) -> Vec<Event> {
        let mut rx = runtime.run_stream(CancellationToken::new(), Arc::clone(session));
        let mut seen = Vec::new();
        while let Some(event) = timeout(WAIT, rx.recv()).await.expect("timed out") {
            let confirm = matches!(event, Event::ToolCallConfirmation { .. });
            seen.push(event);
            if confirm {
                runtime.resume(ResumeRequest::approve()).await.unwrap();
            }
        }
        seen
    }

    /// Verifies a remote turn is indistinguishable from a local one.
    #[tokio::test]
    async fn test_remote_turn_matches_local_turn() {
        let local = scripted_runtime().unwrap();
        let local_session = session("add 2 and 2");
        let local_events = drive(&local, &local_session).await;

        let server = TestServer::start(Arc::new(scripted_runtime) as RuntimeFactory).await;
        let remote = RemoteRuntime::new(server.client());
        let remote_session = session("add 2 and 2");
        let remote_events = drive(&remote, &remote_session).await;

        let types = |events: &[Event]| events.iter().map(Event::type_name).collect::<Vec<_>>();
        assert_eq!(types(&remote_events), types(&local_events));

        let local_state = local_session.lock().await.clone();
        let remote_state = remote_session.lock().await.clone();
        assert_eq!(message_view(&remote_state), message_view(&local_state));
        assert_eq!(
            message_view(&remote_state).last(),
            Some(&(Role::Assistant, "2+2 is 4".to_string()))
        );
        assert_eq!(
            (remote_state.input_tokens, remote_state.output_tokens),
            (local_state.input_tokens, local_state.output_tokens)
        );

        let stored = server.store.get_session(&remote_state.id).await.unwrap();
        assert_eq!(stored.items, remote_state.items);
    }

    fn echo_runtime() -> Result<LocalRuntime> {
        let model = Arc::new(ScriptedProvider::new("scripted/echo").repeat_text("ok"));
        LocalRuntime::builder(Team::single(Agent::new("root", model as Arc<dyn ModelProvider>))).build()
    }

    fn failing_then_echo_runtime() -> Result<LocalRuntime> {
        let model = Arc::new(
            ScriptedProvider::new("scripted/echo")
                .fail(ProviderError::http_status(400, "bad request"))
                .repeat_text("ok"),
        );
        LocalRuntime::builder(Team::single(Agent::new("root", model as Arc<dyn ModelProvider>))).build()
    }

    fn text(role: Role, content: &str) -> (Role, String) {
        (role, content.to_string())
    }

    /// Verifies a second turn sends only the new message and keeps history.
    #[tokio::test]
    async fn test_follow_up_turn_sends_only_pending_messages() {
        let server = TestServer::start(Arc::new(echo_runtime) as RuntimeFactory).await;
        let remote = RemoteRuntime::new(server.client());
        let session = session("first");

        collect_events(remote.run_stream(CancellationToken::new(), Arc::clone(&session))).await;
        session.lock().await.add_user_message("second");
        collect_events(remote.run_stream(CancellationToken::new(), Arc::clone(&session))).await;

        let view = message_view(&session.lock().await.clone());
        assert_eq!(
            view,
            vec![
                (Role::User, "first".to_string()),
                (Role::Assistant, "ok".to_string()),
                (Role::User, "second".to_string()),
                (Role::Assistant, "ok".to_string()),
            ]
        );
    }

    /// Verifies a message whose turn failed is not sent again with the next
    /// turn, matching what the local runtime keeps.
    #[tokio::test]
    async fn test_failed_turn_message_is_not_resent() {
        let local = failing_then_echo_runtime().unwrap();
        let local_session = session("first");
        collect_events(local.run_stream(CancellationToken::new(), Arc::clone(&local_session))).await;
        local_session.lock().await.add_user_message("second");
        collect_events(local.run_stream(CancellationToken::new(), Arc::clone(&local_session))).await;

        let server = TestServer::start(Arc::new(failing_then_echo_runtime) as RuntimeFactory).await;
        let remote = RemoteRuntime::new(server.client());
        let remote_session = session("first");
        let failed = collect_events(remote.run_stream(CancellationToken::new(), Arc::clone(&remote_session))).await;
        assert!(failed.iter().any(|e| matches!(e, Event::Error { .. })));
        remote_session.lock().await.add_user_message("second");
        collect_events(remote.run_stream(CancellationToken::new(), Arc::clone(&remote_session))).await;

        let expected = vec![
            text(Role::User, "first"),
            text(Role::User, "second"),
            text(Role::Assistant, "ok"),
        ];
        assert_eq!(message_view(&local_session.lock().await.clone()), expected);
        let remote_state = remote_session.lock().await.clone();
        assert_eq!(message_view(&remote_state), expected);
        let stored = server.store.get_session(&remote_state.id).await.unwrap();
        assert_eq!(message_view(&stored), expected);
    }

    /// Verifies options changed on a session picked up from the server
    /// apply to the next turn.
    #[tokio::test]
    async fn test_reloaded_session_sends_its_options() {
        let server = TestServer::start(Arc::new(echo_runtime) as RuntimeFactory).await;
        let session = session("hi");
        let id = session.lock().await.id.clone();
        collect_events(RemoteRuntime::new(server.client()).run_stream(CancellationToken::new(), Arc::clone(&session))).await;

        let mut reloaded = server.client().get_session(&id).await.unwrap();
        reloaded.tools_approved = true;
        reloaded.max_iterations = 7;
        reloaded.add_user_message("again");
        let reloaded = reloaded.into_shared();
        let remote = RemoteRuntime::new(server.client());
        collect_events(remote.run_stream(CancellationToken::new(), Arc::clone(&reloaded))).await;

        let stored = server.client().get_session(&id).await.unwrap();
        assert!(stored.tools_approved);
        assert_eq!(stored.max_iterations, 7);
        assert_eq!(
            message_view(&stored),
            vec![
                text(Role::User, "hi"),
                text(Role::Assistant, "ok"),
                text(Role::User, "again"),
                text(Role::Assistant, "ok"),
            ]
        );
        let local = reloaded.lock().await;
        assert!(local.tools_approved);
        assert_eq!(local.max_iterations, 7);
    }

    /// Verifies an unreachable server is reported as a transport error.
    #[tokio::test]
    async fn test_unreachable_server_is_an_error_event() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let remote = RemoteRuntime::new(RemoteClient::new(&format!("http://{addr}")).unwrap());
        let events = timeout(WAIT, collect_events(remote.run_stream(CancellationToken::new(), session("hi"))))
            .await
            .unwrap();
        assert!(matches!(
            events.as_slice(),
            [Event::Error { kind: ErrorKind::Transport, message, .. }]
                if message.starts_with("failed to start remote agent: ")
        ));
    }

    /// Verifies a stream cut before `stream_stopped` is not mistaken for success.
    #[tokio::test]
    async fn test_truncated_stream_is_an_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("^/api/sessions$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(Session::new()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex("^/api/sessions/[^/]+/agent/root$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"type\":\"stream_started\",\"session_id\":\"s\",\"agent_name\":\"root\"}\n\n"),
            )
            .mount(&server)
            .await;

        let remote = RemoteRuntime::new(RemoteClient::new(&server.uri()).unwrap());
        let events = timeout(WAIT, collect_events(remote.run_stream(CancellationToken::new(), session("hi"))))
            .await
            .unwrap();
        let last = events.last().unwrap();
        assert!(matches!(
            last,
            Event::Error { kind: ErrorKind::Transport, message, .. } if message == STREAM_ENDED
        ));
    }

    /// Verifies a summary stream cut before completion is reported.
    #[tokio::test]
    async fn test_truncated_summary_is_an_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("^/api/sessions$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(Session::new()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex("^/api/sessions/[^/]+/summarize$"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(
                        "data: {\"type\":\"session_compaction\",\"agent_name\":\"root\",\"session_id\":\"s\",\"status\":\"started\"}\n\n",
                    ),
            )
            .mount(&server)
            .await;

        let remote = RemoteRuntime::new(RemoteClient::new(&server.uri()).unwrap());
        let (tx, rx) = create_event_channel();
        timeout(
            WAIT,
            remote.summarize(CancellationToken::new(), session("hi"), None, EventSender::new(tx)),
        )
        .await
        .unwrap();
        let events = collect_events(rx).await;
        assert_eq!(events.first().map(Event::type_name), Some("session_compaction"));
        assert!(matches!(
            events.last(),
            Some(Event::Error { kind: ErrorKind::Transport, message, .. }) if message == STREAM_ENDED
        ));
    }

    #[tokio::test]
    async fn test_resume_without_session_fails() {
        let remote = RemoteRuntime::new(RemoteClient::new("http://127.0.0.1:9").unwrap());
        let err = remote.resume(ResumeRequest::approve()).await.unwrap_err();
        assert_eq!(err.to_string(), "no remote session to resume");
    }

    /// Verifies remote summarization compacts the mirrored session.
    #[tokio::test]
    async fn test_remote_summarize_resyncs_compacted_session() {
        let factory: RuntimeFactory = Arc::new(|| {
            let model = Arc::new(
                ScriptedProvider::new("scripted/m")
                    .reply_text("hello there")
                    .reply_text("They greeted each other."),
            );
            LocalRuntime::builder(Team::single(Agent::new("root", model as Arc<dyn ModelProvider>))).build()
        });
        let server = TestServer::start(factory).await;
        let remote = RemoteRuntime::new(server.client());
        let session = session("hi");
        collect_events(remote.run_stream(CancellationToken::new(), Arc::clone(&session))).await;

        let (tx, rx) = create_event_channel();
        remote
            .summarize(CancellationToken::new(), Arc::clone(&session), None, EventSender::new(tx))
            .await;
        let events = collect_events(rx).await;
        assert!(events.iter().any(|e| matches!(e, Event::SessionSummary { .. })));
        assert_eq!(
            session.lock().await.latest_summary(),
            Some("They greeted each other.")
        );
    }
}
