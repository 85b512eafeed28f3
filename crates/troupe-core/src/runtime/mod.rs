//! Runtimes drive the agentic loop.
//!
//! [`Runtime`] is the contract every driver (CLI, HTTP server, tests)
//! talks to. [`LocalRuntime`] runs the loop in-process;
//! [`crate::remote::RemoteRuntime`] proxies it to a server over HTTP.
//! [`PersistentRuntime`] wraps any local runtime with a session store.

mod compaction;
pub mod elicitation;
pub mod fallback;
mod local;
pub mod model_switcher;
mod persistent;
mod team_tools;
mod title;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use compaction::{SUMMARY_PROMPT, SUMMARY_SYSTEM_PROMPT};
pub use local::{LocalRuntime, LocalRuntimeBuilder};
pub use model_switcher::{ModelChoice, ModelResolver};
pub use persistent::PersistentRuntime;
pub use team_tools::{HANDOFF_TOOL, TRANSFER_TASK_TOOL};

use crate::config::{Config, RuntimeConfig};
use crate::core::events::{Event, EventRx, EventSender};
pub use crate::core::resume::{ResumeRequest, ResumeType};
use crate::session::SharedSession;
use crate::team::Team;
use crate::tools::ElicitationAction;

/// Error text of a `run_stream` call on a runtime that is mid-turn.
pub const BUSY_MESSAGE: &str = "runtime is already running a turn";

/// Extra iterations granted when the caller continues past the limit.
pub const ITERATION_EXTENSION: u32 = 10;

/// Operations shared by local and remote runtimes.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Name of the agent that will handle the next model call.
    fn current_agent(&self) -> String;

    /// Starts a turn over `session` and returns its event stream.
    ///
    /// The pending user message must already be in the session. The
    /// stream ends with `stream_stopped` (or closes on cancellation).
    fn run_stream(&self, cancel: CancellationToken, session: SharedSession) -> EventRx;

    /// Answers a pending tool confirmation or iteration-limit suspension.
    /// Returns once the loop has applied the decision.
    async fn resume(&self, request: ResumeRequest) -> Result<()>;

    /// Answers a pending elicitation.
    async fn resume_elicitation(&self, action: ElicitationAction, content: Option<Value>) -> Result<()>;

    /// Summarizes the session and compacts it to the summary plus a tail.
    /// Returns after `session_summary` (or a failure) has been emitted.
    async fn summarize(
        &self,
        cancel: CancellationToken,
        session: SharedSession,
        additional_prompt: Option<String>,
        events: EventSender,
    );

    async fn close(&self) -> Result<()>;
}

/// Knobs of a [`LocalRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Used when neither the session nor the agent sets a budget. Zero means unlimited.
    pub max_iterations: u32,
    /// Summarize automatically when the context nears the model's limit.
    pub session_compaction: bool,
    pub compaction_tail: usize,
    pub generate_titles: bool,
    pub tool_timeout: Option<Duration>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            session_compaction: false,
            compaction_tail: 4,
            generate_titles: false,
            tool_timeout: None,
        }
    }
}

impl From<&RuntimeConfig> for RuntimeOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            session_compaction: config.session_compaction,
            compaction_tail: config.compaction_tail,
            generate_titles: config.generate_titles,
            tool_timeout: config.tool_timeout(),
        }
    }
}

/// Builds the runtime for the team in `config`, starting with `agent` when
/// given and with model switching enabled.
///
/// # Errors
/// Fails on unresolvable models, unknown tool sets or an unknown `agent`.
pub fn local_from_config(config: &Config, agent: Option<&str>) -> Result<LocalRuntime> {
    let team = Team::from_config(config, &ModelResolver::from_config(config))?;
    let mut builder = LocalRuntime::builder(team)
        .options(RuntimeOptions::from(&config.runtime))
        .model_resolver(ModelResolver::from_config(config));
    if let Some(agent) = agent {
        builder = builder.current_agent(agent);
    }
    builder.build()
}

/// Drains `rx` into a vector. Handy for drivers that never suspend.
pub async fn collect_events(mut rx: EventRx) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
