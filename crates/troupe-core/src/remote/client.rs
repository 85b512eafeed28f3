//! HTTP client for the session API served by [`super::server`].

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::wire::{
    ApiMessage, CreateSessionBody, ElicitationBody, ErrorBody, ModelBody, SESSIONS_PATH, SessionOptionsBody,
    SummarizeBody, agent_path, session_path,
};
use crate::core::events::Event;
use crate::core::resume::ResumeRequest;
use crate::providers::USER_AGENT;
use crate::session::{Session, SessionSummary};
use crate::tools::ElicitationAction;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Events decoded from a server-sent stream.
pub type RemoteEventStream = Pin<Box<dyn Stream<Item = Result<Event, RemoteError>> + Send>>;

/// A failed call to the server. `status` is set when the server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    fn from_body(status: u16, body: &str) -> Self {
        let message = match serde_json::from_str::<ErrorBody>(body) {
            Ok(err) if !err.error.is_empty() => format!("API error ({status}): {}", err.error),
            _ => format!("HTTP error {status}: {body}"),
        };
        Self {
            status: Some(status),
            message,
        }
    }

    fn transport(context: &str, err: impl fmt::Display) -> Self {
        Self {
            status: None,
            message: format!("{context}: {err}"),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    base_url: Url,
    http: reqwest::Client,
    timeout: Duration,
}

impl RemoteClient {
    /// # Errors
    /// Fails on an unparsable base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("invalid base URL: {base_url}"))?;
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url,
            http,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Timeout for unary calls. Streams are bounded by the turn instead.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    async fn send(builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::transport("performing request", e))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_body(status.as_u16(), &body));
        }
        Ok(response)
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = Self::send(builder.timeout(self.timeout)).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::transport("reading response body", e))?;
        serde_json::from_slice(&body).context("unmarshaling response")
    }

    async fn call_empty(&self, builder: RequestBuilder) -> Result<()> {
        Self::send(builder.timeout(self.timeout)).await?;
        Ok(())
    }

    async fn stream<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<RemoteEventStream> {
        let builder = self
            .request(Method::POST, path)
            .header("accept", "text/event-stream")
            .header("cache-control", "no-cache")
            .json(body);
        let response = Self::send(builder).await?;
        Ok(decode_events(response.bytes_stream()))
    }

    pub async fn get_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.call(self.request(Method::GET, SESSIONS_PATH)).await
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        self.call(self.request(Method::GET, &session_path(id))).await
    }

    /// Creates a session, keeping the template id if set.
    pub async fn create_session(&self, body: impl Into<CreateSessionBody>) -> Result<Session> {
        let body = body.into();
        self.call(self.request(Method::POST, SESSIONS_PATH).json(&body))
            .await
    }

    /// Changes tool approval or the iteration budget of a session.
    pub async fn update_session(&self, id: &str, options: SessionOptionsBody) -> Result<Session> {
        self.call(self.request(Method::PATCH, &session_path(id)).json(&options))
            .await
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.call_empty(self.request(Method::DELETE, &session_path(id)))
            .await
    }

    pub async fn resume_session(&self, id: &str, request: &ResumeRequest) -> Result<()> {
        let path = format!("{}/resume", session_path(id));
        self.call_empty(self.request(Method::POST, &path).json(request))
            .await
    }

    pub async fn resume_elicitation(&self, id: &str, action: ElicitationAction, content: Option<Value>) -> Result<()> {
        let path = format!("{}/elicitation", session_path(id));
        let body = ElicitationBody { action, content };
        self.call_empty(self.request(Method::POST, &path).json(&body))
            .await
    }

    /// Sets (or with an empty `model`, clears) an agent's model override.
    pub async fn set_agent_model(&self, id: &str, agent: &str, model: &str) -> Result<Session> {
        let path = format!("{}/model", session_path(id));
        let body = ModelBody {
            agent: agent.to_string(),
            model: model.to_string(),
        };
        self.call(self.request(Method::POST, &path).json(&body)).await
    }

    /// Appends `messages` to the session and runs a turn with `agent`.
    pub async fn run_agent(&self, id: &str, agent: &str, messages: &[ApiMessage]) -> Result<RemoteEventStream> {
        self.stream(&agent_path(id, agent), messages).await
    }

    pub async fn summarize(&self, id: &str, instructions: Option<String>) -> Result<RemoteEventStream> {
        let path = format!("{}/summarize", session_path(id));
        self.stream(&path, &SummarizeBody { instructions }).await
    }
}

fn decode_events<S, E>(bytes: S) -> RemoteEventStream
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    Box::pin(bytes.eventsource().filter_map(|item| async move {
        match item {
            Ok(frame) => match serde_json::from_str::<Event>(&frame.data) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!("skipping undecodable remote event: {e}");
                    None
                }
            },
            Err(e) => Some(Err(RemoteError::transport("reading event stream", e))),
        }
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::core::resume::ResumeType;

    async fn client(server: &MockServer) -> RemoteClient {
        RemoteClient::new(&server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_json_error_body_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sessions/nope"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "session not found: nope"})))
            .mount(&server)
            .await;

        let err = client(&server).await.get_session("nope").await.unwrap_err();
        assert_eq!(err.to_string(), "API error (404): session not found: nope");
        assert_eq!(err.downcast_ref::<RemoteError>().unwrap().status, Some(404));
    }

    #[tokio::test]
    async fn test_plain_error_body_becomes_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = client(&server).await.delete_session("abc").await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP error 502: bad gateway");
    }

    #[tokio::test]
    async fn test_resume_posts_confirmation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/s1/resume"))
            .and(body_json(json!({"confirmation": "reject", "reason": "no"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .await
            .resume_session(
                "s1",
                &ResumeRequest {
                    resume_type: ResumeType::Reject,
                    reason: Some("no".to_string()),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_agent_decodes_events_and_skips_garbage() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"stream_started\",\"session_id\":\"s1\",\"agent_name\":\"root\"}\n\n",
            ": keep-alive\n\n",
            "data: not json\n\n",
            "data: {\"type\":\"agent_choice\",\"agent_name\":\"root\",\"content\":\"hi\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/sessions/s1/agent/root"))
            .and(header("accept", "text/event-stream"))
            .and(body_json(json!([{"role": "user", "content": "hello"}])))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let events: Vec<Event> = client(&server)
            .await
            .run_agent("s1", "root", &[ApiMessage::user("hello")])
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        let types: Vec<&str> = events.iter().map(Event::type_name).collect();
        assert_eq!(types, vec!["stream_started", "agent_choice"]);
    }

    #[tokio::test]
    async fn test_run_agent_refused_before_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": "runtime is already running a turn"})))
            .mount(&server)
            .await;

        let Err(err) = client(&server).await.run_agent("s1", "root", &[]).await else {
            panic!("expected an error");
        };
        assert_eq!(err.to_string(), "API error (409): runtime is already running a turn");
    }

    #[test]
    fn test_invalid_base_url() {
        let err = RemoteClient::new("not a url").unwrap_err();
        assert!(err.to_string().starts_with("invalid base URL"));
    }
}
