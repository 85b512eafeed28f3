//! OpenAI-compatible Chat Completions client.
//!
//! Every known provider (and any models gateway) is reached through this
//! wire format.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;

use super::{
    FinishReason, ModelProvider, ModelSpec, ProviderError, ProviderErrorKind, ProviderFactory,
    ProviderResult, ProviderStream, StreamDelta, USER_AGENT, Usage,
};
use crate::session::{Message, Role};
use crate::tools::ToolDefinition;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

pub struct OpenAiCompatibleClient {
    spec: ModelSpec,
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(spec: ModelSpec) -> Self {
        Self {
            spec,
            http: reqwest::Client::new(),
        }
    }
}

/// Default factory: every spec becomes an [`OpenAiCompatibleClient`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiProviderFactory;

impl ProviderFactory for OpenAiProviderFactory {
    fn create(&self, spec: &ModelSpec) -> Result<Arc<dyn ModelProvider>> {
        Ok(Arc::new(OpenAiCompatibleClient::new(spec.clone())))
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleClient {
    fn id(&self) -> String {
        self.spec.reference()
    }

    fn context_limit(&self) -> Option<u64> {
        self.spec.context_limit
    }

    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> ProviderResult<ProviderStream> {
        let request = ChatCompletionRequest::new(&self.spec, messages, tools);
        let url = format!(
            "{}{}",
            self.spec.base_url.trim_end_matches('/'),
            CHAT_COMPLETIONS_PATH
        );

        let response = self
            .http
            .post(&url)
            .headers(build_headers(self.spec.api_key.as_deref()))
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &error_body));
        }

        Ok(Box::pin(ChatCompletionsSseParser::new(response.bytes_stream())))
    }
}

fn build_headers(api_key: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key
        && let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}"))
    {
        headers.insert("authorization", value);
    }
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
    headers
}

fn classify_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Request error: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    stream: bool,
    messages: Vec<ChatCompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatToolCallFunction,
}

#[derive(Debug, Serialize)]
struct ChatToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatToolDefinition {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatToolFunction,
}

#[derive(Debug, Serialize)]
struct ChatToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDefinition> for ChatToolDefinition {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            tool_type: "function",
            function: ChatToolFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        }
    }
}

impl From<&Message> for ChatCompletionMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let tool_calls = (!msg.tool_calls.is_empty()).then(|| {
            msg.tool_calls
                .iter()
                .map(|call| ChatToolCall {
                    id: call.id.clone(),
                    tool_type: "function",
                    function: ChatToolCallFunction {
                        name: call.name.clone(),
                        arguments: if call.arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            call.arguments.clone()
                        },
                    },
                })
                .collect()
        });
        // Assistant turns that only call tools carry no content.
        let content = if msg.role == Role::Assistant && msg.content.is_empty() && tool_calls.is_some()
        {
            None
        } else {
            Some(msg.content.clone())
        };
        Self {
            role,
            content,
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

impl ChatCompletionRequest {
    fn new(spec: &ModelSpec, messages: &[Message], tools: &[ToolDefinition]) -> Self {
        Self {
            model: spec.model.clone(),
            stream: true,
            messages: messages.iter().map(ChatCompletionMessage::from).collect(),
            tools: (!tools.is_empty()).then(|| tools.iter().map(ChatToolDefinition::from).collect()),
            max_tokens: spec.max_tokens,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

/// Appends a blank line when the byte stream ends so a final event without
/// its terminator still gets dispatched by the SSE decoder.
struct SseTerminatedStream<S> {
    inner: S,
    emitted_terminator: bool,
}

impl<S> SseTerminatedStream<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            emitted_terminator: false,
        }
    }
}

impl<S, E> Stream for SseTerminatedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
{
    type Item = std::result::Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.emitted_terminator {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => {
                self.emitted_terminator = true;
                Poll::Ready(Some(Ok(Bytes::from_static(b"\n\n"))))
            }
            other => other,
        }
    }
}

/// SSE parser for OpenAI-compatible chat completions.
struct ChatCompletionsSseParser<S> {
    inner: EventStream<SseTerminatedStream<S>>,
    pending: VecDeque<StreamDelta>,
    saw_tool: bool,
    finished: bool,
}

impl<S> ChatCompletionsSseParser<S> {
    fn new<E>(stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    {
        Self {
            inner: SseTerminatedStream::new(stream).eventsource(),
            pending: VecDeque::new(),
            saw_tool: false,
            finished: false,
        }
    }

    fn handle_event_data(&mut self, data: &str) -> ProviderResult<()> {
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return Ok(());
        }
        let value = serde_json::from_str::<Value>(trimmed).map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Parse,
                format!("Failed to parse SSE JSON: {err}"),
            )
        })?;
        self.handle_chunk(&value)
    }

    fn handle_chunk(&mut self, value: &Value) -> ProviderResult<()> {
        if let Some(error) = value.get("error") {
            let error_type = error.get("type").and_then(Value::as_str).unwrap_or("error");
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(ProviderError::api_error(error_type, message));
        }

        let first_choice = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first());

        if let Some(choice) = first_choice {
            if let Some(delta) = choice.get("delta") {
                self.process_delta(delta);
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                let reason = if self.saw_tool {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::parse(reason)
                };
                self.pending.push_back(StreamDelta::Finish(reason));
                self.finished = true;
            }
        }

        // Usage may arrive in any chunk, often a separate trailing one.
        if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
            self.pending.push_back(StreamDelta::Usage(parse_usage(usage)));
        }
        Ok(())
    }

    fn process_delta(&mut self, delta: &Value) {
        if let Some(text) = delta.get("content").and_then(Value::as_str)
            && !text.is_empty()
        {
            self.pending.push_back(StreamDelta::Text(text.to_string()));
        }

        if let Some(reasoning) = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(Value::as_str)
            && !reasoning.is_empty()
        {
            self.pending
                .push_back(StreamDelta::Reasoning(reasoning.to_string()));
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for tool_call in tool_calls {
                let index = tool_call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let function = tool_call.get("function").unwrap_or(&Value::Null);
                let non_empty = |v: Option<&Value>| {
                    v.and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                };
                self.saw_tool = true;
                self.pending.push_back(StreamDelta::ToolCall {
                    index,
                    id: non_empty(tool_call.get("id")),
                    name: non_empty(function.get("name")),
                    arguments: function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                });
            }
        }
    }
}

impl<S, E> Stream for ChatCompletionsSseParser<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<StreamDelta>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(delta)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Err(err) = self.handle_event_data(&event.data) {
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(ProviderError::new(
                        ProviderErrorKind::Parse,
                        format!("SSE stream error: {e}"),
                    ))));
                }
                Poll::Ready(None) => {
                    // Providers that never send finish_reason still end the turn.
                    if !self.finished {
                        self.finished = true;
                        let reason = if self.saw_tool {
                            FinishReason::ToolCalls
                        } else {
                            FinishReason::Stop
                        };
                        return Poll::Ready(Some(Ok(StreamDelta::Finish(reason))));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn parse_usage(usage: &Value) -> Usage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    Usage {
        input_tokens: field("prompt_tokens"),
        output_tokens: field("completion_tokens"),
    }
}
