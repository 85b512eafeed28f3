//! Configuration management.
//!
//! Loads configuration from ${TROUPE_HOME}/config.toml with sensible defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod paths {
    //! TROUPE_HOME resolution order:
    //! 1. TROUPE_HOME environment variable (if set)
    //! 2. $HOME/.troupe
    //! 3. ./.troupe when no home directory is known

    use std::path::PathBuf;

    pub fn troupe_home() -> PathBuf {
        if let Ok(home) = std::env::var("TROUPE_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }
        std::env::var_os("HOME")
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
            .join(".troupe")
    }

    pub fn config_path() -> PathBuf {
        troupe_home().join("config.toml")
    }

    pub fn sessions_dir() -> PathBuf {
        troupe_home().join("sessions")
    }

    pub fn logs_dir() -> PathBuf {
        troupe_home().join("logs")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_agent: String,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub agents: BTreeMap<String, AgentConfig>,
    pub models: BTreeMap<String, ModelConfig>,
    pub providers: BTreeMap<String, ProviderConfig>,
    /// OpenAI-compatible gateway that serves every provider.
    pub models_gateway: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_agent: "root".to_string(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            agents: BTreeMap::new(),
            models: BTreeMap::new(),
            providers: BTreeMap::new(),
            models_gateway: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Iteration budget per turn when neither session nor agent sets one (0 = unlimited).
    pub max_iterations: u32,
    pub session_compaction: bool,
    /// Messages kept after a summary.
    pub compaction_tail: usize,
    /// Retries of the same model on retryable errors.
    pub model_retries: u32,
    pub generate_titles: bool,
    /// Per tool call timeout in seconds (0 = none).
    pub tool_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            session_compaction: true,
            compaction_tail: 4,
            model_retries: 2,
            generate_titles: true,
            tool_timeout_secs: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `troupe_core=debug`.
    pub level: Option<String>,
    /// Write logs to a daily rolling file in this directory instead of stderr.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model name from `[models]`, `provider/model`, or a comma-separated alloy.
    pub model: String,
    pub description: String,
    pub instruction: String,
    /// Agents this agent may hand the conversation to.
    pub handoffs: Vec<String>,
    /// Agents this agent may transfer tasks to.
    pub sub_agents: Vec<String>,
    /// Tried in order when the primary model keeps failing.
    pub fallback_models: Vec<String>,
    pub max_iterations: u32,
    /// Built-in tool sets: `read_file`, `shell`.
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub context_limit: Option<u64>,
}

/// A custom OpenAI-compatible provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    /// Returns the API key from config if set and non-empty.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns the base URL from config if set and non-empty.
    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl Config {
    /// Loads configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Agent configs in declaration-independent order with the default agent first.
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        if let Some(pos) = names.iter().position(|n| *n == self.default_agent) {
            let default = names.remove(pos);
            names.insert(0, default);
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.default_agent, "root");
        assert!(config.runtime.session_compaction);
        assert_eq!(config.server.listen, "127.0.0.1:8080");
    }

    #[test]
    fn test_parses_team_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
default_agent = "lead"
models_gateway = "https://gateway.example.com/v1"

[runtime]
max_iterations = 12
tool_timeout_secs = 30

[agents.lead]
model = "fast"
instruction = "Coordinate."
handoffs = ["coder"]
tools = ["read_file"]

[agents.coder]
model = "openai/gpt-4o"
sub_agents = []

[models.fast]
provider = "openai"
model = "gpt-4o-mini"
context_limit = 128000

[providers.local]
base_url = "  http://localhost:11434/v1  "
api_key = "   "
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.runtime.max_iterations, 12);
        assert_eq!(config.runtime.tool_timeout(), Some(Duration::from_secs(30)));
        assert!(config.runtime.generate_titles);
        assert_eq!(config.agents["lead"].handoffs, vec!["coder".to_string()]);
        assert_eq!(config.models["fast"].context_limit, Some(128_000));
        assert_eq!(config.agent_names(), vec!["lead".to_string(), "coder".to_string()]);

        let local = &config.providers["local"];
        assert_eq!(local.effective_base_url(), Some("http://localhost:11434/v1"));
        assert_eq!(local.effective_api_key(), None);
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "default_agent = [").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }
}
