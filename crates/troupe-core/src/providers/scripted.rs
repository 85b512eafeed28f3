//! Deterministic provider for tests, demos and offline runs.
//!
//! Each call pops the next scripted reply; once the queue is empty the
//! optional repeat reply is used forever. Requests are recorded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream;

use super::{
    FinishReason, ModelProvider, ProviderError, ProviderErrorKind, ProviderResult, ProviderStream,
    StreamDelta, Usage,
};
use crate::session::Message;
use crate::tools::ToolDefinition;

#[derive(Debug, Clone)]
enum Reply {
    Deltas(Vec<StreamDelta>),
    ToolCall { name: String, arguments: String },
    Fail(ProviderError),
    Hang,
}

pub struct ScriptedProvider {
    id: String,
    context_limit: Option<u64>,
    queue: Mutex<VecDeque<Reply>>,
    repeat: Option<Reply>,
    requests: Mutex<Vec<Vec<Message>>>,
    calls: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_limit: None,
            queue: Mutex::new(VecDeque::new()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_context_limit(mut self, limit: u64) -> Self {
        self.context_limit = Some(limit);
        self
    }

    fn push(self, reply: Reply) -> Self {
        lock(&self.queue).push_back(reply);
        self
    }

    /// Queues a plain text answer.
    #[must_use]
    pub fn reply_text(self, text: &str) -> Self {
        self.push(Reply::Deltas(vec![
            StreamDelta::Text(text.to_string()),
            StreamDelta::Usage(Usage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            StreamDelta::Finish(FinishReason::Stop),
        ]))
    }

    /// Queues a single tool call.
    #[must_use]
    pub fn reply_tool_call(self, name: &str, arguments: &str) -> Self {
        self.push(Reply::ToolCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        })
    }

    /// Queues raw deltas.
    #[must_use]
    pub fn reply(self, deltas: Vec<StreamDelta>) -> Self {
        self.push(Reply::Deltas(deltas))
    }

    /// Queues a failing call.
    #[must_use]
    pub fn fail(self, error: ProviderError) -> Self {
        self.push(Reply::Fail(error))
    }

    /// Queues a call whose stream never produces anything.
    #[must_use]
    pub fn hang(self) -> Self {
        self.push(Reply::Hang)
    }

    /// Once the queue is drained, every call requests this tool.
    #[must_use]
    pub fn repeat_tool_call(mut self, name: &str, arguments: &str) -> Self {
        self.repeat = Some(Reply::ToolCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        });
        self
    }

    /// Once the queue is drained, every call answers with this text.
    #[must_use]
    pub fn repeat_text(mut self, text: &str) -> Self {
        self.repeat = Some(Reply::Deltas(vec![
            StreamDelta::Text(text.to_string()),
            StreamDelta::Finish(FinishReason::Stop),
        ]));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Histories received so far, one per call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn context_limit(&self) -> Option<u64> {
        self.context_limit
    }

    async fn stream_completion(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> ProviderResult<ProviderStream> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(messages.to_vec());

        let reply = lock(&self.queue).pop_front().or_else(|| self.repeat.clone());
        let deltas = match reply {
            Some(Reply::Deltas(deltas)) => deltas,
            Some(Reply::ToolCall { name, arguments }) => vec![
                StreamDelta::ToolCall {
                    index: 0,
                    id: Some(format!("call_{n}")),
                    name: Some(name),
                    arguments,
                },
                StreamDelta::Usage(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                StreamDelta::Finish(FinishReason::ToolCalls),
            ],
            Some(Reply::Fail(err)) => return Err(err),
            Some(Reply::Hang) => {
                return Ok(Box::pin(stream::pending::<ProviderResult<StreamDelta>>()));
            }
            None => {
                return Err(ProviderError::new(
                    ProviderErrorKind::ApiError,
                    format!("scripted provider {} has no reply for call {}", self.id, n + 1),
                ));
            }
        };
        Ok(Box::pin(stream::iter(deltas.into_iter().map(Ok))))
    }
}
