//! Agents and teams.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::config::Config;
use crate::core::events::AgentDetails;
use crate::providers::ModelProvider;
use crate::runtime::fallback::FallbackProvider;
use crate::runtime::model_switcher::ModelResolver;
use crate::tools::{ToolSet, builtin_tool_set};

/// A named persona with its own instructions, model and tools.
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    pub description: String,
    pub instruction: String,
    pub model: Arc<dyn ModelProvider>,
    pub toolsets: Vec<Arc<dyn ToolSet>>,
    pub handoffs: Vec<String>,
    pub sub_agents: Vec<String>,
    /// Zero defers to the runtime default.
    pub max_iterations: u32,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model.id())
            .field("toolsets", &self.toolsets.len())
            .field("handoffs", &self.handoffs)
            .field("sub_agents", &self.sub_agents)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(name: impl Into<String>, model: Arc<dyn ModelProvider>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            model,
            toolsets: Vec::new(),
            handoffs: Vec::new(),
            sub_agents: Vec::new(),
            max_iterations: 0,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    #[must_use]
    pub fn with_toolset(mut self, toolset: Arc<dyn ToolSet>) -> Self {
        self.toolsets.push(toolset);
        self
    }

    #[must_use]
    pub fn with_handoffs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handoffs = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_sub_agents<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_agents = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }
}

/// An ordered set of agents with a default entry point.
#[derive(Debug, Clone)]
pub struct Team {
    agents: Vec<Arc<Agent>>,
    default_agent: String,
}

impl Team {
    /// Builds a team whose first agent is the default.
    ///
    /// # Errors
    /// Fails on an empty team, duplicate names, or handoff/sub-agent
    /// references to unknown agents.
    pub fn new(agents: Vec<Agent>) -> Result<Self> {
        let Some(first) = agents.first() else {
            bail!("a team needs at least one agent");
        };
        let default_agent = first.name.clone();

        let mut names = HashSet::new();
        for agent in &agents {
            if !names.insert(agent.name.as_str()) {
                bail!("duplicate agent name: {}", agent.name);
            }
        }
        for agent in &agents {
            for target in agent.handoffs.iter().chain(&agent.sub_agents) {
                if !names.contains(target.as_str()) {
                    bail!("agent {} references unknown agent {target}", agent.name);
                }
            }
        }

        Ok(Self {
            agents: agents.into_iter().map(Arc::new).collect(),
            default_agent,
        })
    }

    /// A team of one.
    pub fn single(agent: Agent) -> Self {
        Self {
            default_agent: agent.name.clone(),
            agents: vec![Arc::new(agent)],
        }
    }

    pub fn with_default_agent(mut self, name: &str) -> Result<Self> {
        if self.agent(name).is_none() {
            bail!("agent not found: {name}");
        }
        self.default_agent = name.to_string();
        Ok(self)
    }

    pub fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.iter().find(|a| a.name == name).cloned()
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    pub fn details(&self) -> Vec<AgentDetails> {
        self.agents
            .iter()
            .map(|a| AgentDetails {
                name: a.name.clone(),
                description: a.description.clone(),
                model: a.model.id(),
            })
            .collect()
    }

    /// Stops every tool set of every agent. Tool set lifecycle belongs to
    /// whoever built the team, not to the runtime.
    pub async fn stop_tool_sets(&self) {
        for agent in &self.agents {
            for toolset in &agent.toolsets {
                if let Err(e) = toolset.stop().await {
                    tracing::warn!(agent = %agent.name, "stopping tool set failed: {e:#}");
                }
            }
        }
    }

    /// Builds the team described by `config`.
    ///
    /// Agent models are resolved through `resolver` and wrapped with the
    /// configured retries and fallbacks.
    pub fn from_config(config: &Config, resolver: &ModelResolver) -> Result<Self> {
        if config.agents.is_empty() {
            bail!("no agents configured: add an [agents.<name>] section");
        }

        let mut agents = Vec::new();
        for name in config.agent_names() {
            let agent_config = &config.agents[&name];
            let primary = resolver
                .resolve(&agent_config.model)
                .with_context(|| format!("resolving model for agent {name}"))?;
            let mut chain = vec![primary];
            for fallback in &agent_config.fallback_models {
                chain.push(
                    resolver
                        .resolve(fallback)
                        .with_context(|| format!("resolving fallback model for agent {name}"))?,
                );
            }
            let model: Arc<dyn ModelProvider> =
                Arc::new(FallbackProvider::new(chain, config.runtime.model_retries));

            let mut agent = Agent::new(&name, model)
                .with_description(&agent_config.description)
                .with_instruction(&agent_config.instruction)
                .with_handoffs(agent_config.handoffs.iter().cloned())
                .with_sub_agents(agent_config.sub_agents.iter().cloned())
                .with_max_iterations(agent_config.max_iterations);
            for tool in &agent_config.tools {
                let toolset = builtin_tool_set(tool)
                    .with_context(|| format!("agent {name}: unknown tool set '{tool}'"))?;
                agent = agent.with_toolset(toolset);
            }
            agents.push(agent);
        }
        Team::new(agents)
    }
}
