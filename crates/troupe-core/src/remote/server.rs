//! axum server exposing sessions and turns over HTTP.
//!
//! Each session that has been touched through the API keeps one runtime
//! for the life of the server, so a resume call reaches the loop that
//! suspended. Turn events are streamed as `text/event-stream`; closing the
//! stream cancels the turn.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::Stream;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::wire::{
    ApiMessage, CreateSessionBody, ElicitationBody, ModelBody, SessionOptionsBody, SummarizeBody, encode_sse,
};
use crate::core::events::{EventRx, EventSender, create_event_channel};
use crate::core::resume::{ResumeError, ResumeRequest};
use crate::runtime::{BUSY_MESSAGE, LocalRuntime, PersistentRuntime, Runtime};
use crate::session::{
    Message, Role, Session, SessionStore, SessionSummary, SharedSession, StoreError, persist_if_needed,
    resolve_session_id,
};

/// Builds the runtime for a session the server has not served yet.
pub type RuntimeFactory = Arc<dyn Fn() -> Result<LocalRuntime> + Send + Sync>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Conflict(m) | ApiError::Internal(m) => {
                f.write_str(m)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if code == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {self}");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (code, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(store) = err.downcast_ref::<StoreError>() {
            return match store {
                StoreError::NotFound(_) => ApiError::NotFound(store.to_string()),
                _ => ApiError::BadRequest(store.to_string()),
            };
        }
        if let Some(resume) = err.downcast_ref::<ResumeError>() {
            return ApiError::Conflict(resume.to_string());
        }
        ApiError::Internal(format!("{err:#}"))
    }
}

struct ActiveSession {
    runtime: PersistentRuntime,
    session: SharedSession,
    /// Parent of every turn on this session. Cancelled on delete.
    cancel: CancellationToken,
    /// Held by the response of the running turn or summary.
    turn: Arc<Mutex<()>>,
}

impl ActiveSession {
    /// Claims the session for one streamed operation.
    fn claim(&self) -> Result<OwnedMutexGuard<()>, ApiError> {
        let busy = || ApiError::Conflict(BUSY_MESSAGE.to_string());
        let turn = Arc::clone(&self.turn).try_lock_owned().map_err(|_| busy())?;
        // A disconnected client releases the claim before its loop unwinds.
        if self.runtime.local().is_busy() {
            return Err(busy());
        }
        Ok(turn)
    }
}

struct Inner {
    store: Arc<dyn SessionStore>,
    factory: RuntimeFactory,
    active: Mutex<HashMap<String, Arc<ActiveSession>>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ServerState {
    inner: Arc<Inner>,
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState").finish_non_exhaustive()
    }
}

impl ServerState {
    pub fn new(store: Arc<dyn SessionStore>, factory: RuntimeFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                factory,
                active: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Cancelling this token stops the server and every running turn.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    fn activate(&self, session: Session) -> Result<Arc<ActiveSession>, ApiError> {
        let runtime = (self.inner.factory)().map_err(|e| ApiError::Internal(format!("{e:#}")))?;
        Ok(Arc::new(ActiveSession {
            runtime: PersistentRuntime::new(runtime, Arc::clone(&self.inner.store)),
            session: session.into_shared(),
            cancel: self.inner.shutdown.child_token(),
            turn: Arc::new(Mutex::new(())),
        }))
    }

    /// The live entry for `id`, loading the session from the store if needed.
    async fn active(&self, id: &str) -> Result<Arc<ActiveSession>, ApiError> {
        let mut active = self.inner.active.lock().await;
        if let Some(entry) = active.get(id) {
            return Ok(Arc::clone(entry));
        }
        let session = self.inner.store.get_session(id).await?;
        let entry = self.activate(session)?;
        active.insert(id.to_string(), Arc::clone(&entry));
        tracing::debug!(session_id = %id, "session activated");
        Ok(entry)
    }

    /// Like [`Self::active`] but never loads: resume targets a running loop.
    async fn running(&self, id: &str) -> Result<Arc<ActiveSession>, ApiError> {
        self.inner
            .active
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("session not found".to_string()))
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).patch(update_session).delete(delete_session),
        )
        .route("/api/sessions/{id}/agent/{agent}", post(run_agent))
        .route("/api/sessions/{id}/resume", post(resume))
        .route("/api/sessions/{id}/elicitation", post(resume_elicitation))
        .route("/api/sessions/{id}/summarize", post(summarize))
        .route("/api/sessions/{id}/model", post(set_model))
        .with_state(state)
}

/// Serves until the state's shutdown token is cancelled.
///
/// # Errors
/// Fails when the listener breaks.
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<()> {
    let shutdown = state.shutdown_token();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;
    tracing::info!("server stopped");
    Ok(())
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(stream)).into_response()
}

/// Streams `rx` as SSE. The guards live as long as the body: a client that
/// disconnects cancels the work behind it, and the session takes no other
/// turn until the stream ends.
fn event_stream(rx: EventRx, cancel: DropGuard, turn: OwnedMutexGuard<()>) -> Response {
    let stream = futures_util::stream::unfold((rx, cancel, turn), |(mut rx, cancel, turn)| async move {
        let event = rx.recv().await?;
        Some((Ok(encode_sse(&event)), (rx, cancel, turn)))
    });
    sse_response(stream)
}

async fn list_sessions(State(state): State<ServerState>) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.inner.store.get_session_summaries().await?))
}

async fn create_session(
    State(state): State<ServerState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let mut session = Session::from_template(&body.template);
    if let Some(dir) = &session.working_dir {
        validate_working_dir(dir).await?;
    }
    session.items = body.items;

    let mut active = state.inner.active.lock().await;
    if active.contains_key(&session.id) || state.inner.store.get_session(&session.id).await.is_ok() {
        return Err(ApiError::Conflict(format!("session already exists: {}", session.id)));
    }
    let entry = state.activate(session.clone())?;
    active.insert(session.id.clone(), entry);
    tracing::info!(session_id = %session.id, "session created");
    Ok((StatusCode::CREATED, Json(session)))
}

async fn validate_working_dir(dir: &FsPath) -> Result<(), ApiError> {
    let metadata = tokio::fs::metadata(dir)
        .await
        .map_err(|e| ApiError::BadRequest(format!("working directory {}: {e}", dir.display())))?;
    if !metadata.is_dir() {
        return Err(ApiError::BadRequest("working directory must be a directory".to_string()));
    }
    Ok(())
}

/// Accepts an id, `-N` or `last`.
async fn get_session(State(state): State<ServerState>, Path(reference): Path<String>) -> Result<Json<Session>, ApiError> {
    let entry = state.inner.active.lock().await.get(&reference).cloned();
    if let Some(entry) = entry {
        return Ok(Json(entry.session.lock().await.clone()));
    }
    let id = resolve_session_id(state.inner.store.as_ref(), &reference).await?;
    Ok(Json(state.inner.store.get_session(&id).await?))
}

/// Applies per-session options; a running turn sees them from its next check.
async fn update_session(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(options): Json<SessionOptionsBody>,
) -> Result<Json<Session>, ApiError> {
    let entry = state.active(&id).await?;
    let mut snapshot = {
        let mut session = entry.session.lock().await;
        if let Some(approved) = options.tools_approved {
            session.tools_approved = approved;
        }
        if let Some(max_iterations) = options.max_iterations {
            session.max_iterations = max_iterations;
        }
        session.clone()
    };
    if persist_if_needed(entry.runtime.store().as_ref(), &mut snapshot).await? {
        entry.session.lock().await.persisted = true;
    }
    tracing::debug!(
        session_id = %id,
        tools_approved = snapshot.tools_approved,
        max_iterations = snapshot.max_iterations,
        "session options updated"
    );
    Ok(Json(snapshot))
}

async fn delete_session(State(state): State<ServerState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let removed = state.inner.active.lock().await.remove(&id);
    if let Some(entry) = &removed {
        entry.cancel.cancel();
    }
    match state.inner.store.delete_session(&id).await {
        Ok(()) => {}
        // Never persisted: it only lived in memory.
        Err(e) if removed.is_some() && matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_))) => {}
        Err(e) => return Err(e.into()),
    }
    tracing::info!(session_id = %id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn run_agent(
    State(state): State<ServerState>,
    Path((id, agent)): Path<(String, String)>,
    Json(messages): Json<Vec<ApiMessage>>,
) -> Result<Response, ApiError> {
    let entry = state.active(&id).await?;
    let turn = entry.claim()?;
    let local = entry.runtime.local();
    if local.team().agent(&agent).is_none() {
        return Err(ApiError::NotFound(format!("agent not found: {agent}")));
    }

    if let Some(bad) = messages
        .iter()
        .find(|m| !matches!(m.role, Role::User | Role::Assistant))
    {
        return Err(ApiError::BadRequest(format!("unsupported message role: {:?}", bad.role)));
    }
    {
        let mut session = entry.session.lock().await;
        for message in messages {
            if message.role == Role::User {
                session.add_user_message(message.content);
            } else {
                session.add_message(Message::assistant(&agent, message.content));
            }
        }
    }
    local.set_current_agent(&agent)?;

    let cancel = entry.cancel.child_token();
    tracing::debug!(session_id = %id, agent = %agent, "starting turn");
    let rx = entry.runtime.run_stream(cancel.clone(), Arc::clone(&entry.session));
    Ok(event_stream(rx, cancel.drop_guard(), turn))
}

async fn resume(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> Result<StatusCode, ApiError> {
    let entry = state.running(&id).await?;
    entry.runtime.resume(request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_elicitation(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(body): Json<ElicitationBody>,
) -> Result<StatusCode, ApiError> {
    let entry = state.running(&id).await?;
    entry.runtime.resume_elicitation(body.action, body.content).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn summarize(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(body): Json<SummarizeBody>,
) -> Result<Response, ApiError> {
    let entry = state.active(&id).await?;
    let turn = entry.claim()?;

    let (tx, rx) = create_event_channel();
    let cancel = entry.cancel.child_token();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        entry
            .runtime
            .summarize(task_cancel, Arc::clone(&entry.session), body.instructions, EventSender::new(tx))
            .await;
    });
    Ok(event_stream(rx, cancel.drop_guard(), turn))
}

async fn set_model(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(body): Json<ModelBody>,
) -> Result<Json<Session>, ApiError> {
    let entry = state.active(&id).await?;
    entry
        .runtime
        .set_agent_model(&entry.session, &body.agent, &body.model)
        .await
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    Ok(Json(entry.session.lock().await.clone()))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::SocketAddr;

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::core::events::Event;
    use crate::providers::{ModelProvider, ScriptedProvider};
    use crate::remote::RemoteClient;
    use crate::session::{InMemorySessionStore, SessionTemplate};
    use crate::team::{Agent, Team};
    use crate::tools::{StaticToolSet, Tool, ToolCallResult, ToolDefinition};

    /// A running server on an ephemeral port. Dropping it shuts it down.
    pub(crate) struct TestServer {
        pub addr: SocketAddr,
        pub store: Arc<InMemorySessionStore>,
        shutdown: CancellationToken,
    }

    impl TestServer {
        pub async fn start(factory: RuntimeFactory) -> Self {
            let store = Arc::new(InMemorySessionStore::new());
            let state = ServerState::new(Arc::clone(&store) as Arc<dyn SessionStore>, factory);
            let shutdown = state.shutdown_token();
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve(listener, state));
            Self { addr, store, shutdown }
        }

        pub fn client(&self) -> RemoteClient {
            RemoteClient::new(&format!("http://{}", self.addr)).unwrap()
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn echo_factory() -> RuntimeFactory {
        Arc::new(|| {
            let model = Arc::new(ScriptedProvider::new("scripted/echo").repeat_text("echo"));
            LocalRuntime::builder(Team::single(Agent::new("root", model as Arc<dyn ModelProvider>))).build()
        })
    }

    #[tokio::test]
    async fn test_create_respects_template_id_and_rejects_duplicates() {
        let server = TestServer::start(echo_factory()).await;
        let client = server.client();
        let template = SessionTemplate {
            id: Some("fixed-id".to_string()),
            max_iterations: 5,
            ..SessionTemplate::default()
        };

        let session = client.create_session(template.clone()).await.unwrap();
        assert_eq!(session.id, "fixed-id");
        assert_eq!(session.max_iterations, 5);

        let err = client.create_session(template.clone()).await.unwrap_err();
        assert_eq!(err.to_string(), "API error (409): session already exists: fixed-id");

        // Empty sessions live in memory only until they get content.
        assert!(client.get_sessions().await.unwrap().is_empty());
        assert_eq!(client.get_session("fixed-id").await.unwrap().id, "fixed-id");
    }

    #[tokio::test]
    async fn test_working_dir_must_exist() {
        let server = TestServer::start(echo_factory()).await;
        let file = tempfile::NamedTempFile::new().unwrap();
        let template = SessionTemplate {
            working_dir: Some(file.path().to_path_buf()),
            ..SessionTemplate::default()
        };
        let err = server.client().create_session(template).await.unwrap_err();
        assert_eq!(err.to_string(), "API error (400): working directory must be a directory");
    }

    #[tokio::test]
    async fn test_unknown_session_and_agent() {
        let server = TestServer::start(echo_factory()).await;
        let client = server.client();

        let err = client.get_session("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "API error (404): session not found: missing");

        let err = client.resume_session("missing", &ResumeRequest::approve()).await.unwrap_err();
        assert_eq!(err.to_string(), "API error (404): session not found");

        let session = client.create_session(SessionTemplate::default()).await.unwrap();
        let Err(err) = client.run_agent(&session.id, "ghost", &[ApiMessage::user("hi")]).await else {
            panic!("expected an error");
        };
        assert_eq!(err.to_string(), "API error (404): agent not found: ghost");
    }

    #[tokio::test]
    async fn test_turn_persists_and_relative_lookup_works() {
        let server = TestServer::start(echo_factory()).await;
        let client = server.client();
        let session = client.create_session(SessionTemplate::default()).await.unwrap();

        let events: Vec<Event> = client
            .run_agent(&session.id, "root", &[ApiMessage::user("hi")])
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(events.last().map(Event::type_name), Some("stream_stopped"));

        let stored = server.store.get_session(&session.id).await.unwrap();
        assert_eq!(stored.messages().count(), 2);
        let latest = client.get_session("-1").await.unwrap();
        assert_eq!(latest.id, session.id);

        let err = client.resume_session(&session.id, &ResumeRequest::approve()).await.unwrap_err();
        assert!(err.to_string().starts_with("API error (409): nothing to resume"));

        client.delete_session(&session.id).await.unwrap();
        assert!(client.get_sessions().await.unwrap().is_empty());
    }

    /// Runtimes whose first turn stops at a tool confirmation.
    fn confirming_factory() -> RuntimeFactory {
        Arc::new(|| {
            let noop = Tool::new(ToolDefinition::new("noop", "Does nothing", json!({"type": "object"})), |_call, _ctx| async {
                Ok(ToolCallResult::success("done"))
            });
            let model = Arc::new(
                ScriptedProvider::new("scripted/m")
                    .reply_tool_call("noop", "{}")
                    .reply_text("finished"),
            );
            let agent = Agent::new("root", model as Arc<dyn ModelProvider>)
                .with_toolset(Arc::new(StaticToolSet::new().with_tool(noop)));
            LocalRuntime::builder(Team::single(agent)).build()
        })
    }

    /// Verifies that of two turns racing for one session, the loser is
    /// refused before its messages reach the session.
    #[tokio::test]
    async fn test_concurrent_turns_leave_history_alone() {
        let server = TestServer::start(confirming_factory()).await;
        let client = server.client();
        let session = client.create_session(SessionTemplate::default()).await.unwrap();

        let messages_one = [ApiMessage::user("one")];
        let messages_two = [ApiMessage::user("two")];
        let (first, second) = tokio::join!(
            client.run_agent(&session.id, "root", &messages_one),
            client.run_agent(&session.id, "root", &messages_two),
        );
        let (mut stream, err) = match (first, second) {
            (Ok(stream), Err(err)) | (Err(err), Ok(stream)) => (stream, err),
            _ => panic!("expected exactly one turn to start"),
        };
        assert_eq!(err.to_string(), format!("API error (409): {BUSY_MESSAGE}"));

        while let Some(event) = stream.next().await {
            if event.unwrap().is_suspend() {
                client.resume_session(&session.id, &ResumeRequest::approve()).await.unwrap();
            }
        }

        let stored = client.get_session(&session.id).await.unwrap();
        let users: Vec<&Message> = stored.messages().filter(|m| m.role == Role::User).collect();
        assert_eq!(users.len(), 1);
        assert_eq!(stored.last_message().unwrap().content, "finished");
    }

    #[tokio::test]
    async fn test_update_session_options() {
        let server = TestServer::start(echo_factory()).await;
        let client = server.client();
        let session = client.create_session(SessionTemplate::default()).await.unwrap();

        let updated = client
            .update_session(
                &session.id,
                SessionOptionsBody {
                    tools_approved: Some(true),
                    ..SessionOptionsBody::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.tools_approved);
        assert_eq!(updated.max_iterations, 0);

        let err = client
            .update_session("missing", SessionOptionsBody::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "API error (404): session not found: missing");
    }

    #[tokio::test]
    async fn test_bad_message_role() {
        let server = TestServer::start(echo_factory()).await;
        let client = server.client();
        let session = client.create_session(SessionTemplate::default()).await.unwrap();
        let response = reqwest::Client::new()
            .post(format!("http://{}/api/sessions/{}/agent/root", server.addr, session.id))
            .json(&json!([{"role": "tool", "content": "x"}]))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
