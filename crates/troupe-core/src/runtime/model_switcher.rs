//! Model reference resolution and per-agent overrides.
//!
//! A reference is one of:
//! - a model name from `[models]` in the config,
//! - `provider/model`,
//! - an inline alloy `p1/m1,p2/m2` whose calls rotate through the parts.
//!
//! Providers are reachable through a `[providers.<name>]` section, an
//! `<NAME>_API_KEY` environment variable, or the configured models gateway.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, ModelConfig, ProviderConfig};
use crate::providers::{
    ModelProvider, ModelRef, ModelSpec, OpenAiProviderFactory, ProviderFactory, ProviderResult,
    ProviderStream, known_provider, validate_base_url,
};
use crate::session::Message;
use crate::tools::ToolDefinition;

/// Source of environment variables. Swappable so resolution is testable.
pub trait EnvProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEnv;

impl EnvProvider for OsEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct MapEnv(pub HashMap<String, String>);

impl MapEnv {
    pub fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl EnvProvider for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Environment variable carrying the gateway credential.
pub const GATEWAY_API_KEY_ENV: &str = "TROUPE_GATEWAY_API_KEY";

/// An entry of [`ModelResolver::available_models`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    /// What to pass to `set_agent_model`.
    pub reference: String,
    /// `provider/model` behind a config model name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Turns model references into providers.
pub struct ModelResolver {
    models: BTreeMap<String, ModelConfig>,
    providers: BTreeMap<String, ProviderConfig>,
    gateway: Option<String>,
    env: Arc<dyn EnvProvider>,
    factory: Arc<dyn ProviderFactory>,
}

impl std::fmt::Debug for ModelResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelResolver")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl ModelResolver {
    pub fn new(config: &Config, env: Arc<dyn EnvProvider>, factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            models: config.models.clone(),
            providers: config.providers.clone(),
            gateway: config
                .models_gateway
                .as_deref()
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string),
            env,
            factory,
        }
    }

    /// Resolver over the process environment building OpenAI-compatible clients.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(OsEnv), Arc::new(OpenAiProviderFactory))
    }

    /// Resolves a non-empty reference to a provider.
    ///
    /// # Errors
    /// Fails on malformed references and unreachable providers.
    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn ModelProvider>> {
        let reference = reference.trim();
        if reference.contains(',') {
            return self.resolve_alloy(reference);
        }

        if let Some(model) = self.models.get(reference) {
            let spec = self.spec_for(&model.provider, &model.model, Some(model))?;
            return self.factory.create(&spec);
        }

        let Some(model_ref) = ModelRef::parse(reference) else {
            bail!(
                "invalid model reference \"{reference}\": expected a model name from config or 'provider/model' format"
            );
        };
        let spec = self.spec_for(&model_ref.provider, &model_ref.model, None)?;
        self.factory.create(&spec)
    }

    fn resolve_alloy(&self, reference: &str) -> Result<Arc<dyn ModelProvider>> {
        let mut parts = Vec::new();
        for part in reference.split(',').map(str::trim) {
            let Some(model_ref) = ModelRef::parse(part) else {
                bail!(
                    "invalid model reference \"{part}\" in inline alloy: expected 'provider/model' format"
                );
            };
            let spec = self.spec_for(&model_ref.provider, &model_ref.model, None)?;
            parts.push(self.factory.create(&spec)?);
        }
        Ok(Arc::new(AlloyProvider::new(parts)?))
    }

    fn spec_for(&self, provider: &str, model: &str, config: Option<&ModelConfig>) -> Result<ModelSpec> {
        let mut spec = ModelSpec {
            provider: provider.to_string(),
            model: model.to_string(),
            base_url: String::new(),
            api_key: None,
            max_tokens: config.and_then(|c| c.max_tokens),
            context_limit: config.and_then(|c| c.context_limit),
        };
        let explicit_base = config
            .and_then(|c| c.base_url.as_deref())
            .map(str::trim)
            .filter(|u| !u.is_empty());

        if let Some(custom) = self.providers.get(provider) {
            spec.api_key = custom
                .effective_api_key()
                .map(str::to_string)
                .or_else(|| custom.api_key_env.as_deref().and_then(|k| self.env.get(k)));
            spec.base_url = explicit_base
                .or(custom.effective_base_url())
                .ok_or_else(|| anyhow!("provider \"{provider}\" has no base_url configured"))?
                .to_string();
        } else if let Some(gateway) = &self.gateway {
            spec.api_key = self.env.get(GATEWAY_API_KEY_ENV);
            spec.base_url = explicit_base.unwrap_or(gateway).to_string();
        } else {
            let env_var = known_provider(provider).map_or_else(
                || format!("{}_API_KEY", provider.to_ascii_uppercase().replace('-', "_")),
                |known| known.env_var.to_string(),
            );
            let Some(key) = self.env.get(&env_var) else {
                bail!(
                    "provider \"{provider}\" is not available: set {env_var} or configure a models gateway"
                );
            };
            spec.api_key = Some(key);
            spec.base_url = match (explicit_base, known_provider(provider)) {
                (Some(url), _) => url.to_string(),
                (None, Some(known)) => known.base_url.to_string(),
                (None, None) => bail!("provider \"{provider}\" has no base_url configured"),
            };
        }

        validate_base_url(&spec.base_url, provider)?;
        Ok(spec)
    }

    /// Config models plus `provider/` prefixes reachable right now.
    pub fn available_models(&self) -> Vec<ModelChoice> {
        let mut choices: Vec<ModelChoice> = self
            .models
            .iter()
            .map(|(name, m)| ModelChoice {
                reference: name.clone(),
                target: Some(format!("{}/{}", m.provider, m.model)),
            })
            .collect();

        let mut providers: Vec<String> = self.providers.keys().cloned().collect();
        for known in crate::providers::KNOWN_PROVIDERS {
            if self.gateway.is_some() || self.env.get(known.env_var).is_some() {
                providers.push(known.name.to_string());
            }
        }
        providers.sort();
        providers.dedup();
        choices.extend(providers.into_iter().map(|p| ModelChoice {
            reference: format!("{p}/"),
            target: None,
        }));
        choices
    }
}

/// Rotates calls across several providers.
pub struct AlloyProvider {
    parts: Vec<Arc<dyn ModelProvider>>,
    next: AtomicUsize,
}

impl AlloyProvider {
    /// # Errors
    /// Fails when `parts` is empty.
    pub fn new(parts: Vec<Arc<dyn ModelProvider>>) -> Result<Self> {
        if parts.is_empty() {
            bail!("an alloy needs at least one model");
        }
        Ok(Self {
            parts,
            next: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ModelProvider for AlloyProvider {
    fn id(&self) -> String {
        self.parts.iter().map(|p| p.id()).collect::<Vec<_>>().join(",")
    }

    fn context_limit(&self) -> Option<u64> {
        self.parts.iter().filter_map(|p| p.context_limit()).min()
    }

    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> ProviderResult<ProviderStream> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.parts.len();
        self.parts[index].stream_completion(messages, tools).await
    }
}
