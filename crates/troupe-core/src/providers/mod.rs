//! Model providers.
//!
//! The loop only depends on [`ModelProvider::stream_completion`]: given a
//! history and tool definitions it returns a stream of [`StreamDelta`]s.
//! Wire formats live in the concrete clients.

pub mod openai;
pub mod scripted;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use openai::{OpenAiCompatibleClient, OpenAiProviderFactory};
pub use scripted::ScriptedProvider;

use crate::session::Message;
use crate::tools::ToolDefinition;

/// Standard User-Agent header for outgoing API requests.
pub const USER_AGENT: &str = concat!("troupe/", env!("CARGO_PKG_VERSION"));

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection timeout or request timeout
    Timeout,
    /// Failed to parse response (JSON parse error, invalid SSE, etc.)
    Parse,
    /// API-level error returned by the provider mid-stream
    ApiError,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::HttpStatus => write!(f, "http_status"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::ApiError => write!(f, "api_error"),
        }
    }
}

/// Structured error from the provider with kind and details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// HTTP status, when the error came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Optional additional details (e.g., raw error body)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            details: None,
        }
    }

    /// Creates an HTTP status error, pulling `error.message` out of a JSON body.
    pub fn http_status(status: u16, body: &str) -> Self {
        let mut err = Self::new(ProviderErrorKind::HttpStatus, format!("HTTP {status}"));
        err.status = Some(status);
        if body.is_empty() {
            return err;
        }
        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(msg) = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
        {
            err.message = format!("HTTP {status}: {msg}");
        }
        err.details = Some(body.to_string());
        err
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Creates an API error (from mid-stream error event).
    pub fn api_error(error_type: &str, message: &str) -> Self {
        Self::new(ProviderErrorKind::ApiError, format!("{error_type}: {message}"))
    }

    /// Whether retrying the same model can help: 5xx, 408 and timeouts.
    /// Rate limits (429) and other 4xx move on to the next model instead.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ProviderErrorKind::Timeout => true,
            ProviderErrorKind::HttpStatus => {
                self.status.is_some_and(|s| s >= 500 || s == 408)
            }
            ProviderErrorKind::Parse | ProviderErrorKind::ApiError => false,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Token usage of one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" => FinishReason::Stop,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "length" | "max_tokens" => FinishReason::Length,
            _ => FinishReason::Other,
        }
    }
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Text(String),
    Reasoning(String),
    /// Tool call fragment. Fragments with the same `index` belong to one call;
    /// `id` and `name` usually arrive with the first fragment only.
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Usage(Usage),
    Finish(FinishReason),
}

pub type ProviderStream = BoxStream<'static, ProviderResult<StreamDelta>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Reference of the backing model, `provider/model`.
    fn id(&self) -> String;

    /// Context window in tokens, when known.
    fn context_limit(&self) -> Option<u64> {
        None
    }

    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> ProviderResult<ProviderStream>;
}

/// A `provider/model` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    /// Parses `provider/model`. Both halves must be non-empty.
    pub fn parse(reference: &str) -> Option<Self> {
        let (provider, model) = reference.trim().split_once('/')?;
        let (provider, model) = (provider.trim(), model.trim());
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// A provider reachable through an `<NAME>_API_KEY` credential.
#[derive(Debug, Clone, Copy)]
pub struct KnownProvider {
    pub name: &'static str,
    pub env_var: &'static str,
    /// OpenAI-compatible base URL.
    pub base_url: &'static str,
}

pub const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider {
        name: "openai",
        env_var: "OPENAI_API_KEY",
        base_url: "https://api.openai.com/v1",
    },
    KnownProvider {
        name: "anthropic",
        env_var: "ANTHROPIC_API_KEY",
        base_url: "https://api.anthropic.com/v1",
    },
    KnownProvider {
        name: "google",
        env_var: "GOOGLE_API_KEY",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
    },
    KnownProvider {
        name: "mistral",
        env_var: "MISTRAL_API_KEY",
        base_url: "https://api.mistral.ai/v1",
    },
    KnownProvider {
        name: "xai",
        env_var: "XAI_API_KEY",
        base_url: "https://api.x.ai/v1",
    },
    KnownProvider {
        name: "openrouter",
        env_var: "OPENROUTER_API_KEY",
        base_url: "https://openrouter.ai/api/v1",
    },
];

pub fn known_provider(name: &str) -> Option<&'static KnownProvider> {
    KNOWN_PROVIDERS.iter().find(|p| p.name == name)
}

/// Fully resolved model: what a factory needs to build a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub context_limit: Option<u64>,
}

impl ModelSpec {
    pub fn reference(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// Builds providers from resolved specs.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, spec: &ModelSpec) -> Result<Arc<dyn ModelProvider>>;
}

/// Validates that a base URL is well-formed.
pub fn validate_base_url(url: &str, provider_name: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid {provider_name} base URL: {url}"))?;
    Ok(())
}
