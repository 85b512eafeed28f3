//! Retries and fallback models.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::providers::{ModelProvider, ProviderError, ProviderResult, ProviderStream};
use crate::session::Message;
use crate::tools::ToolDefinition;

/// Delay before the first retry; doubles on each further attempt.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Calls the primary model, retrying retryable failures with exponential
/// backoff, then moves down the fallback chain.
///
/// Only opening the stream is retried. Once deltas flow, a failure belongs
/// to the turn.
pub struct FallbackProvider {
    chain: Vec<Arc<dyn ModelProvider>>,
    retries: u32,
    backoff: Duration,
}

impl FallbackProvider {
    /// `chain[0]` is the primary model.
    pub fn new(chain: Vec<Arc<dyn ModelProvider>>, retries: u32) -> Self {
        Self {
            chain,
            retries,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl ModelProvider for FallbackProvider {
    fn id(&self) -> String {
        self.chain.first().map(|m| m.id()).unwrap_or_default()
    }

    fn context_limit(&self) -> Option<u64> {
        self.chain.first().and_then(|m| m.context_limit())
    }

    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> ProviderResult<ProviderStream> {
        let mut last_error = None;
        for (position, model) in self.chain.iter().enumerate() {
            let mut attempt = 0;
            loop {
                match model.stream_completion(messages, tools).await {
                    Ok(stream) => {
                        if position > 0 {
                            tracing::info!(model = %model.id(), "using fallback model");
                        }
                        return Ok(stream);
                    }
                    Err(e) if e.is_retryable() && attempt < self.retries => {
                        let delay = self.backoff * 2u32.saturating_pow(attempt);
                        attempt += 1;
                        tracing::warn!(
                            model = %model.id(),
                            attempt,
                            "model call failed, retrying in {delay:?}: {e}"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        tracing::warn!(model = %model.id(), "model call failed: {e}");
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ProviderError::new(
                crate::providers::ProviderErrorKind::ApiError,
                "no model configured",
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ScriptedProvider;

    fn chain(providers: &[&Arc<ScriptedProvider>]) -> Vec<Arc<dyn ModelProvider>> {
        providers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn ModelProvider>)
            .collect()
    }

    /// Verifies 5xx errors are retried on the same model.
    #[tokio::test(start_paused = true)]
    async fn test_retries_server_errors() {
        let primary = Arc::new(
            ScriptedProvider::new("openai/a")
                .fail(ProviderError::http_status(503, ""))
                .fail(ProviderError::http_status(500, ""))
                .reply_text("ok"),
        );
        let provider = FallbackProvider::new(chain(&[&primary]), 2);
        assert!(provider.stream_completion(&[], &[]).await.is_ok());
        assert_eq!(primary.calls(), 3);
    }

    /// Verifies rate limits skip straight to the next model.
    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_moves_to_fallback() {
        let primary = Arc::new(ScriptedProvider::new("openai/a").fail(ProviderError::http_status(429, "")));
        let backup = Arc::new(ScriptedProvider::new("openai/b").reply_text("ok"));
        let provider = FallbackProvider::new(chain(&[&primary, &backup]), 2);

        assert!(provider.stream_completion(&[], &[]).await.is_ok());
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
        assert_eq!(provider.id(), "openai/a");
    }

    /// Verifies the last error surfaces when every model fails.
    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chain_returns_last_error() {
        let primary = Arc::new(ScriptedProvider::new("openai/a").fail(ProviderError::http_status(400, "")));
        let backup = Arc::new(
            ScriptedProvider::new("openai/b")
                .fail(ProviderError::http_status(502, ""))
                .fail(ProviderError::http_status(502, "")),
        );
        let provider = FallbackProvider::new(chain(&[&primary, &backup]), 1);

        let err = provider.stream_completion(&[], &[]).await.err().unwrap();
        assert_eq!(err.status, Some(502));
        assert_eq!(backup.calls(), 2);
    }
}
