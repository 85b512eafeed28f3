//! In-process runtime: the agentic loop.
//!
//! One turn is: emit the turn header, then repeat model call, confirmation,
//! tool execution until the model stops calling tools, the iteration budget
//! is refused, or the turn is cancelled. Every suspension goes through the
//! runtime's single [`ResumeGate`] slot, registered before the suspend event
//! is emitted, and acknowledged only after the decision has been applied.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::elicitation::ElicitationHandle;
use super::model_switcher::{ModelChoice, ModelResolver};
use super::team_tools::{self, HANDOFF_TOOL, TRANSFER_TASK_TOOL};
use super::{BUSY_MESSAGE, ITERATION_EXTENSION, ResumeRequest, ResumeType, Runtime, RuntimeOptions};
use crate::core::events::{
    AgentDetails, ElicitationMode, ErrorKind, Event, EventRx, EventSender, create_event_channel,
};
use crate::core::resume::{Decision, ResumeGate, Resumed, SuspendKind};
use crate::providers::{FinishReason, ModelProvider, ProviderError, StreamDelta, Usage};
use crate::session::{Item, Message, Role, Session, SharedSession};
use crate::team::{Agent, Team};
use crate::tools::{
    AuthorizationRequired, ElicitationAction, ElicitationRequest, ElicitationResponse, Tool,
    ToolCall, ToolCallResult, ToolContext, ToolDefinition,
};

pub(crate) const REJECTED_TOOL_CALL: &str = "The user rejected the tool call.";
pub(crate) const CANCELED_TOOL_CALL: &str = "The tool call was canceled by the user.";
const NO_OUTPUT: &str = "(no output)";
/// Fraction of the context window that triggers automatic compaction.
const AUTO_COMPACT_THRESHOLD: f64 = 0.9;

/// How a loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopOutcome {
    /// The model answered without tool calls.
    Completed,
    /// The caller refused to continue past the iteration budget.
    Stopped,
    Canceled,
    /// An error event was emitted.
    Failed(String),
}

pub(super) struct Inner {
    pub(super) team: Team,
    current_agent: RwLock<Arc<Agent>>,
    pub(super) gate: Arc<ResumeGate>,
    pub(super) options: RuntimeOptions,
    resolver: Option<ModelResolver>,
    overrides: RwLock<HashMap<String, Arc<dyn ModelProvider>>>,
    busy: AtomicBool,
    started_toolsets: tokio::sync::Mutex<HashSet<(String, usize)>>,
}

/// Runs the agentic loop in-process.
///
/// Cloning is cheap and clones share state: the current agent, the pending
/// suspension and model overrides.
#[derive(Clone)]
pub struct LocalRuntime {
    pub(super) inner: Arc<Inner>,
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("current_agent", &self.current_agent())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

pub struct LocalRuntimeBuilder {
    team: Team,
    options: RuntimeOptions,
    resolver: Option<ModelResolver>,
    current_agent: Option<String>,
}

impl LocalRuntimeBuilder {
    #[must_use]
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables [`LocalRuntime::set_agent_model`].
    #[must_use]
    pub fn model_resolver(mut self, resolver: ModelResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn current_agent(mut self, name: impl Into<String>) -> Self {
        self.current_agent = Some(name.into());
        self
    }

    /// # Errors
    /// Fails when the starting agent is not part of the team.
    pub fn build(self) -> Result<LocalRuntime> {
        let name = self
            .current_agent
            .unwrap_or_else(|| self.team.default_agent().to_string());
        let Some(current) = self.team.agent(&name) else {
            bail!("agent not found: {name}");
        };
        Ok(LocalRuntime {
            inner: Arc::new(Inner {
                team: self.team,
                current_agent: RwLock::new(current),
                gate: ResumeGate::new(),
                options: self.options,
                resolver: self.resolver,
                overrides: RwLock::new(HashMap::new()),
                busy: AtomicBool::new(false),
                started_toolsets: tokio::sync::Mutex::new(HashSet::new()),
            }),
        })
    }
}

/// Clears the busy flag when the turn ends.
struct BusyGuard(Arc<Inner>);

impl BusyGuard {
    fn acquire(inner: &Arc<Inner>) -> Option<Self> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(inner)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Tools offered to the model for one iteration.
struct Toolbox {
    tools: Vec<Tool>,
    builtins: Vec<ToolDefinition>,
}

impl Toolbox {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| t.definition.clone())
            .chain(self.builtins.iter().cloned())
            .collect()
    }

    fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.builtins
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .or_else(|| {
                self.tools
                    .iter()
                    .find(|t| t.name() == name)
                    .map(|t| t.definition.clone())
            })
    }

    fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name() == name)
    }
}

/// Accumulates one streamed completion.
#[derive(Default)]
struct AssistantTurn {
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    usage: Option<Usage>,
    finish: Option<FinishReason>,
}

impl AssistantTurn {
    fn tool_call(&mut self, index: u32, id: Option<String>, name: Option<String>, arguments: &str) -> ToolCall {
        let call = self.tool_calls.entry(index).or_insert_with(|| ToolCall {
            id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            call.name = name;
        }
        call.arguments.push_str(arguments);
        call.clone()
    }

    fn into_message(self, agent_name: &str, model: String) -> Message {
        let mut message = Message::assistant(agent_name, self.content);
        message.reasoning = (!self.reasoning.is_empty()).then_some(self.reasoning);
        message.tool_calls = self
            .tool_calls
            .into_iter()
            .map(|(index, mut call)| {
                if call.id.is_empty() {
                    call.id = format!("toolcall-{index}");
                }
                call
            })
            .collect();
        message.model = Some(model);
        message.usage = self.usage;
        message
    }
}

/// What happened to one tool call.
struct CallResult {
    result: ToolCallResult,
    sub_session: Option<Session>,
    canceled: bool,
}

impl CallResult {
    fn plain(result: ToolCallResult) -> Self {
        Self {
            result,
            sub_session: None,
            canceled: false,
        }
    }

    fn canceled() -> Self {
        Self {
            result: ToolCallResult::error(CANCELED_TOOL_CALL),
            sub_session: None,
            canceled: true,
        }
    }
}

enum Confirmation {
    Run,
    Rejected(Option<String>),
    Canceled,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl LocalRuntime {
    pub fn builder(team: Team) -> LocalRuntimeBuilder {
        LocalRuntimeBuilder {
            team,
            options: RuntimeOptions::default(),
            resolver: None,
            current_agent: None,
        }
    }

    pub fn team(&self) -> &Team {
        &self.inner.team
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// The suspension the loop is waiting on, if any.
    pub fn pending_suspension(&self) -> Option<SuspendKind> {
        self.inner.gate.pending()
    }

    /// Whether a turn or a summarization is in progress.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// # Errors
    /// Fails when `name` is not part of the team.
    pub fn set_current_agent(&self, name: &str) -> Result<()> {
        let Some(agent) = self.inner.team.agent(name) else {
            bail!("agent not found: {name}");
        };
        *write(&self.inner.current_agent) = agent;
        Ok(())
    }

    pub(super) fn current_agent_arc(&self) -> Arc<Agent> {
        Arc::clone(&read(&self.inner.current_agent))
    }

    /// The model `agent` uses right now, honoring overrides.
    pub(super) fn model_for(&self, agent: &Agent) -> Arc<dyn ModelProvider> {
        read(&self.inner.overrides)
            .get(&agent.name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&agent.model))
    }

    pub(super) fn team_details(&self) -> Vec<AgentDetails> {
        self.inner
            .team
            .agents()
            .iter()
            .map(|agent| AgentDetails {
                name: agent.name.clone(),
                description: agent.description.clone(),
                model: self.model_for(agent).id(),
            })
            .collect()
    }

    /// Switches `agent_name` to `reference` for this runtime and records the
    /// override on the session. An empty reference restores the default.
    ///
    /// # Errors
    /// Fails when switching is not configured, the agent is unknown, or the
    /// reference does not resolve. Nothing changes on failure.
    pub async fn set_agent_model(&self, session: &SharedSession, agent_name: &str, reference: &str) -> Result<()> {
        let Some(resolver) = &self.inner.resolver else {
            bail!("model switching not configured for this runtime");
        };
        if self.inner.team.agent(agent_name).is_none() {
            bail!("agent not found: {agent_name}");
        }

        let reference = reference.trim();
        if reference.is_empty() {
            write(&self.inner.overrides).remove(agent_name);
            session.lock().await.agent_model_overrides.remove(agent_name);
            tracing::info!(agent = %agent_name, "model override cleared");
            return Ok(());
        }

        let provider = resolver.resolve(reference)?;
        write(&self.inner.overrides).insert(agent_name.to_string(), provider);
        session
            .lock()
            .await
            .agent_model_overrides
            .insert(agent_name.to_string(), reference.to_string());
        tracing::info!(agent = %agent_name, model = %reference, "model override set");
        Ok(())
    }

    /// Models that [`Self::set_agent_model`] can switch to.
    pub fn available_models(&self) -> Vec<ModelChoice> {
        self.inner
            .resolver
            .as_ref()
            .map(ModelResolver::available_models)
            .unwrap_or_default()
    }

    /// Rebuilds the override map from the session. Overrides that no longer
    /// resolve are logged and the agent keeps its default model.
    async fn apply_session_overrides(&self, session: &SharedSession) {
        let stored = session.lock().await.agent_model_overrides.clone();
        let mut overrides = HashMap::new();
        for (agent_name, reference) in stored {
            if self.inner.team.agent(&agent_name).is_none() {
                tracing::warn!(agent = %agent_name, "ignoring model override for unknown agent");
                continue;
            }
            let Some(resolver) = &self.inner.resolver else {
                tracing::warn!(agent = %agent_name, model = %reference, "model switching not configured, ignoring stored override");
                continue;
            };
            match resolver.resolve(&reference) {
                Ok(provider) => {
                    tracing::debug!(agent = %agent_name, model = %reference, "re-applied model override");
                    overrides.insert(agent_name, provider);
                }
                Err(e) => {
                    tracing::warn!(agent = %agent_name, model = %reference, "failed to re-apply model override, using default: {e:#}");
                }
            }
        }
        *write(&self.inner.overrides) = overrides;
    }

    async fn run_turn(&self, cancel: &CancellationToken, session: &SharedSession, events: &EventSender) {
        self.apply_session_overrides(session).await;

        let (session_id, pending) = {
            let s = session.lock().await;
            let pending: Vec<String> = s
                .trailing_user_messages()
                .into_iter()
                .map(|m| m.content.clone())
                .collect();
            (s.id.clone(), pending)
        };
        let agent = self.current_agent_arc();
        tracing::info!(session_id = %session_id, agent = %agent.name, "turn started");

        events
            .send(Event::AgentInfo {
                agent_name: agent.name.clone(),
                model: self.model_for(&agent).id(),
                description: agent.description.clone(),
            })
            .await;
        events
            .send(Event::TeamInfo {
                available_agents: self.team_details(),
                current_agent: agent.name.clone(),
            })
            .await;
        for message in pending {
            events
                .send(Event::UserMessage {
                    session_id: session_id.clone(),
                    message,
                })
                .await;
        }
        events
            .send(Event::StreamStarted {
                session_id: session_id.clone(),
                agent_name: agent.name.clone(),
            })
            .await;

        let outcome = self.run_loop(cancel, session, events, None).await;
        tracing::info!(session_id = %session_id, ?outcome, "turn finished");

        if self.inner.options.generate_titles && outcome != LoopOutcome::Canceled {
            self.generate_title(cancel, session, events).await;
        }

        events
            .send(Event::StreamStopped {
                session_id,
                agent_name: self.current_agent(),
            })
            .await;
    }

    /// The loop proper. With `pinned` set, the loop always uses that agent
    /// (task transfer); otherwise it follows the current agent, which a
    /// handoff may change between iterations.
    pub(super) fn run_loop<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        session: &'a SharedSession,
        events: &'a EventSender,
        pinned: Option<Arc<Agent>>,
    ) -> BoxFuture<'a, LoopOutcome> {
        Box::pin(async move {
            let mut iteration: u32 = 0;
            let mut max_iterations = {
                let agent = pinned.clone().unwrap_or_else(|| self.current_agent_arc());
                let s = session.lock().await;
                [s.max_iterations, agent.max_iterations, self.inner.options.max_iterations]
                    .into_iter()
                    .find(|&m| m > 0)
                    .unwrap_or(0)
            };

            loop {
                if cancel.is_cancelled() {
                    return LoopOutcome::Canceled;
                }
                let agent = pinned.clone().unwrap_or_else(|| self.current_agent_arc());

                if max_iterations > 0 && iteration >= max_iterations {
                    tracing::debug!(agent = %agent.name, max_iterations, "iteration budget reached");
                    let Some(resumed) = self.suspend_for_iterations(cancel, max_iterations, events).await else {
                        return LoopOutcome::Canceled;
                    };
                    match &resumed.decision {
                        Decision::Resume(request) if request.resume_type != ResumeType::Reject => {
                            max_iterations = iteration + ITERATION_EXTENSION;
                            resumed.ack();
                        }
                        _ => {
                            let message = Message::assistant(
                                &agent.name,
                                format!(
                                    "Execution stopped after reaching the configured max_iterations limit ({max_iterations})."
                                ),
                            );
                            self.commit(session, &agent.name, vec![Item::Message { message }], events)
                                .await;
                            resumed.ack();
                            return LoopOutcome::Stopped;
                        }
                    }
                }
                iteration += 1;

                let Some(toolbox) = self.toolbox(cancel, &agent, events).await else {
                    return LoopOutcome::Canceled;
                };

                let model = self.model_for(&agent);
                if self.inner.options.session_compaction && pinned.is_none() {
                    self.maybe_auto_compact(cancel, session, model.as_ref(), events).await;
                    if cancel.is_cancelled() {
                        return LoopOutcome::Canceled;
                    }
                }

                let history = {
                    let s = session.lock().await;
                    s.history(&self.system_prompt(&agent))
                };
                let definitions = toolbox.definitions();

                let turn = match self
                    .stream_model(cancel, &agent.name, model.as_ref(), &history, &definitions, events)
                    .await
                {
                    Ok(Some(turn)) => turn,
                    Ok(None) => return LoopOutcome::Canceled,
                    Err(e) => {
                        let message = format!("creating chat completion: {e}");
                        tracing::error!(agent = %agent.name, "{message}");
                        events
                            .send(Event::error(Some(&agent.name), ErrorKind::from(e.kind), message.clone()))
                            .await;
                        return LoopOutcome::Failed(message);
                    }
                };

                self.record_usage(session, &agent.name, turn.usage, model.context_limit(), events)
                    .await;

                if turn.finish == Some(FinishReason::Length) {
                    events
                        .send(Event::Warning {
                            agent_name: agent.name.clone(),
                            message: "The model response was cut off at its output token limit.".to_string(),
                        })
                        .await;
                }

                let assistant = turn.into_message(&agent.name, model.id());
                if assistant.tool_calls.is_empty() {
                    if !assistant.content.is_empty() || assistant.reasoning.is_some() {
                        self.commit(session, &agent.name, vec![Item::Message { message: assistant }], events)
                            .await;
                    }
                    return LoopOutcome::Completed;
                }

                if !self
                    .process_tool_calls(cancel, session, &agent, &toolbox, assistant, events)
                    .await
                {
                    return LoopOutcome::Canceled;
                }
            }
        })
    }

    fn system_prompt(&self, agent: &Agent) -> String {
        let mut parts = Vec::new();
        if !agent.instruction.is_empty() {
            parts.push(agent.instruction.clone());
        }
        parts.extend(agent.toolsets.iter().filter_map(|t| t.instructions()));
        parts.extend(team_tools::team_instructions(&self.inner.team, agent));
        parts.join("\n\n")
    }

    async fn suspend_for_iterations(
        &self,
        cancel: &CancellationToken,
        max_iterations: u32,
        events: &EventSender,
    ) -> Option<Resumed> {
        let suspension = match self.inner.gate.suspend(SuspendKind::MaxIterations) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("cannot suspend for iteration limit: {e}");
                return None;
            }
        };
        events.send(Event::MaxIterationsReached { max_iterations }).await;
        suspension.wait(cancel, events).await
    }

    /// Starts the agent's tool sets on first use and collects their tools.
    /// Returns `None` when the turn was cancelled meanwhile.
    async fn toolbox(&self, cancel: &CancellationToken, agent: &Arc<Agent>, events: &EventSender) -> Option<Toolbox> {
        let mut tools = Vec::new();
        for (index, toolset) in agent.toolsets.iter().enumerate() {
            if !self.ensure_started(cancel, agent, index, events).await {
                if cancel.is_cancelled() {
                    return None;
                }
                continue;
            }
            match toolset.tools().await {
                Ok(set) => tools.extend(set),
                Err(e) => {
                    tracing::warn!(agent = %agent.name, "listing tools failed: {e:#}");
                    events
                        .send(Event::Warning {
                            agent_name: agent.name.clone(),
                            message: format!("failed to list tools: {e:#}"),
                        })
                        .await;
                }
            }
        }
        Some(Toolbox {
            tools,
            builtins: team_tools::definitions(agent),
        })
    }

    async fn ensure_started(
        &self,
        cancel: &CancellationToken,
        agent: &Arc<Agent>,
        index: usize,
        events: &EventSender,
    ) -> bool {
        let key = (agent.name.clone(), index);
        if self.inner.started_toolsets.lock().await.contains(&key) {
            return true;
        }
        let toolset = &agent.toolsets[index];

        let mut authorized = false;
        loop {
            let err = match toolset.start().await {
                Ok(()) => {
                    self.inner.started_toolsets.lock().await.insert(key);
                    return true;
                }
                Err(e) => e,
            };

            let auth = err.downcast_ref::<AuthorizationRequired>().cloned();
            let Some(auth) = auth.filter(|_| !authorized) else {
                tracing::warn!(agent = %agent.name, "tool set failed to start: {err:#}");
                events
                    .send(Event::Warning {
                        agent_name: agent.name.clone(),
                        message: format!("failed to start tool set: {err:#}"),
                    })
                    .await;
                return false;
            };

            let handle = ElicitationHandle::new(
                Arc::clone(&self.inner.gate),
                events.clone(),
                agent.name.clone(),
                cancel.clone(),
            );
            let response = match handle
                .elicit(ElicitationRequest {
                    message: auth.message.clone(),
                    mode: ElicitationMode::Url,
                    url: Some(auth.url.clone()),
                    ..Default::default()
                })
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(agent = %agent.name, "authorization request failed: {e:#}");
                    return false;
                }
            };
            if cancel.is_cancelled() {
                return false;
            }

            events
                .send(Event::Authorization {
                    agent_name: agent.name.clone(),
                    action: response.action,
                })
                .await;
            if response.action != ElicitationAction::Accept {
                events
                    .send(Event::Warning {
                        agent_name: agent.name.clone(),
                        message: format!(
                            "Authorization {} for {}; continuing without those tools.",
                            match response.action {
                                ElicitationAction::Decline => "declined",
                                _ => "canceled",
                            },
                            auth.url
                        ),
                    })
                    .await;
                return false;
            }
            authorized = true;
        }
    }

    async fn maybe_auto_compact(
        &self,
        cancel: &CancellationToken,
        session: &SharedSession,
        model: &dyn ModelProvider,
        events: &EventSender,
    ) {
        let Some(limit) = model.context_limit().filter(|&l| l > 0) else {
            return;
        };
        let context_length = session.lock().await.context_length;
        #[allow(clippy::cast_precision_loss)]
        let over = context_length as f64 > limit as f64 * AUTO_COMPACT_THRESHOLD;
        if over {
            tracing::info!(context_length, limit, "context nearly full, compacting session");
            self.compact_session(cancel, session, None, events).await;
        }
    }

    /// Streams one completion, forwarding deltas as events.
    /// `Ok(None)` means the turn was cancelled.
    async fn stream_model(
        &self,
        cancel: &CancellationToken,
        agent_name: &str,
        model: &dyn ModelProvider,
        history: &[Message],
        tools: &[ToolDefinition],
        events: &EventSender,
    ) -> Result<Option<AssistantTurn>, ProviderError> {
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            result = model.stream_completion(history, tools) => result?,
        };

        let mut turn = AssistantTurn::default();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            let Some(delta) = next else {
                return Ok(Some(turn));
            };
            match delta? {
                StreamDelta::Text(text) if !text.is_empty() => {
                    turn.content.push_str(&text);
                    events
                        .send(Event::AgentChoice {
                            agent_name: agent_name.to_string(),
                            content: text,
                        })
                        .await;
                }
                StreamDelta::Reasoning(text) if !text.is_empty() => {
                    turn.reasoning.push_str(&text);
                    events
                        .send(Event::AgentChoiceReasoning {
                            agent_name: agent_name.to_string(),
                            content: text,
                        })
                        .await;
                }
                StreamDelta::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let tool_call = turn.tool_call(index, id, name, &arguments);
                    events
                        .send(Event::PartialToolCall {
                            agent_name: agent_name.to_string(),
                            tool_call,
                        })
                        .await;
                }
                StreamDelta::Usage(usage) => turn.usage = Some(usage),
                StreamDelta::Finish(reason) => turn.finish = Some(reason),
                StreamDelta::Text(_) | StreamDelta::Reasoning(_) => {}
            }
        }
    }

    async fn record_usage(
        &self,
        session: &SharedSession,
        agent_name: &str,
        usage: Option<Usage>,
        context_limit: Option<u64>,
        events: &EventSender,
    ) {
        let Some(usage) = usage else {
            return;
        };
        let event = {
            let mut s = session.lock().await;
            s.input_tokens += usage.input_tokens;
            s.output_tokens += usage.output_tokens;
            s.context_length = usage.input_tokens + usage.output_tokens;
            Event::TokenUsage {
                agent_name: agent_name.to_string(),
                session_id: s.id.clone(),
                input_tokens: s.input_tokens,
                output_tokens: s.output_tokens,
                context_length: s.context_length,
                context_limit,
            }
        };
        events.send(event).await;
    }

    /// Appends `items` to the session in one step and reports the messages.
    pub(super) async fn commit(&self, session: &SharedSession, agent_name: &str, items: Vec<Item>, events: &EventSender) {
        let (session_id, added) = {
            let mut s = session.lock().await;
            let added: Vec<Message> = items
                .iter()
                .filter_map(|item| match item {
                    Item::Message { message } => Some(message.clone()),
                    _ => None,
                })
                .collect();
            s.items.extend(items);
            (s.id.clone(), added)
        };
        for message in added {
            events
                .send(Event::MessageAdded {
                    agent_name: message.agent_name.clone().unwrap_or_else(|| agent_name.to_string()),
                    session_id: session_id.clone(),
                    message,
                })
                .await;
        }
    }

    /// Handles every tool call of one assistant message, then appends the
    /// message and all results together. Returns false when cancelled.
    async fn process_tool_calls(
        &self,
        cancel: &CancellationToken,
        session: &SharedSession,
        agent: &Arc<Agent>,
        toolbox: &Toolbox,
        assistant: Message,
        events: &EventSender,
    ) -> bool {
        let calls = assistant.tool_calls.clone();
        let mut items = vec![Item::Message { message: assistant }];
        let mut canceled = false;

        for call in &calls {
            let outcome = if canceled || cancel.is_cancelled() {
                CallResult::canceled()
            } else {
                self.handle_tool_call(cancel, session, agent, toolbox, call, events).await
            };
            canceled |= outcome.canceled;

            let output = if outcome.result.output.is_empty() && !outcome.result.is_error {
                NO_OUTPUT.to_string()
            } else {
                outcome.result.output
            };
            events
                .send(Event::ToolCallResponse {
                    agent_name: agent.name.clone(),
                    tool_call: call.clone(),
                    response: output.clone(),
                    is_error: outcome.result.is_error,
                })
                .await;
            if let Some(child) = outcome.sub_session {
                items.push(Item::SubSession {
                    session: Box::new(child),
                });
            }
            items.push(Item::Message {
                message: Message::tool_result(&agent.name, &call.id, output),
            });
        }

        self.commit(session, &agent.name, items, events).await;
        !canceled
    }

    async fn handle_tool_call(
        &self,
        cancel: &CancellationToken,
        session: &SharedSession,
        agent: &Arc<Agent>,
        toolbox: &Toolbox,
        call: &ToolCall,
        events: &EventSender,
    ) -> CallResult {
        let Some(definition) = toolbox.definition(&call.name) else {
            tracing::warn!(agent = %agent.name, tool = %call.name, "model called an unknown tool");
            return CallResult::plain(ToolCallResult::error(format!("Tool '{}' not found", call.name)));
        };

        let approved = definition.is_read_only() || session.lock().await.tools_approved;
        if !approved {
            match self.confirm(cancel, session, agent, call, &definition, events).await {
                Confirmation::Run => {}
                Confirmation::Canceled => return CallResult::canceled(),
                Confirmation::Rejected(reason) => {
                    let mut text = REJECTED_TOOL_CALL.to_string();
                    if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
                        text.push_str(" Reason: ");
                        text.push_str(reason.trim());
                    }
                    tracing::info!(agent = %agent.name, tool = %call.name, "tool call rejected");
                    return CallResult::plain(ToolCallResult::error(text));
                }
            }
        }

        events
            .send(Event::ToolCall {
                agent_name: agent.name.clone(),
                tool_call: call.clone(),
                tool_definition: definition,
            })
            .await;

        match call.name.as_str() {
            HANDOFF_TOOL => CallResult::plain(team_tools::handoff(self, agent, call)),
            TRANSFER_TASK_TOOL => {
                let (result, child) = team_tools::transfer_task(self, cancel, session, agent, call, events).await;
                CallResult {
                    result,
                    sub_session: child,
                    canceled: cancel.is_cancelled(),
                }
            }
            _ => match toolbox.tool(&call.name) {
                Some(tool) => self.execute(cancel, session, agent, tool, call, events).await,
                None => CallResult::plain(ToolCallResult::error(format!("Tool '{}' not found", call.name))),
            },
        }
    }

    async fn confirm(
        &self,
        cancel: &CancellationToken,
        session: &SharedSession,
        agent: &Arc<Agent>,
        call: &ToolCall,
        definition: &ToolDefinition,
        events: &EventSender,
    ) -> Confirmation {
        let suspension = match self.inner.gate.suspend(SuspendKind::ToolConfirmation) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(tool = %call.name, "cannot suspend for confirmation: {e}");
                return Confirmation::Canceled;
            }
        };
        events
            .send(Event::ToolCallConfirmation {
                agent_name: agent.name.clone(),
                tool_call: call.clone(),
                tool_definition: definition.clone(),
            })
            .await;

        let Some(resumed) = suspension.wait(cancel, events).await else {
            return Confirmation::Canceled;
        };
        let confirmation = match &resumed.decision {
            Decision::Resume(ResumeRequest {
                resume_type: ResumeType::Approve,
                ..
            }) => Confirmation::Run,
            Decision::Resume(ResumeRequest {
                resume_type: ResumeType::ApproveSession,
                ..
            }) => {
                session.lock().await.tools_approved = true;
                tracing::info!(agent = %agent.name, "tools approved for the rest of the session");
                Confirmation::Run
            }
            Decision::Resume(ResumeRequest { reason, .. }) => Confirmation::Rejected(reason.clone()),
            Decision::Elicitation(_) => Confirmation::Rejected(None),
        };
        resumed.ack();
        confirmation
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        session: &SharedSession,
        agent: &Arc<Agent>,
        tool: &Tool,
        call: &ToolCall,
        events: &EventSender,
    ) -> CallResult {
        let working_dir = session.lock().await.working_dir().to_path_buf();
        let ctx = ToolContext {
            working_dir,
            cancel: cancel.child_token(),
            timeout: self.inner.options.tool_timeout,
            elicitation: Some(ElicitationHandle::new(
                Arc::clone(&self.inner.gate),
                events.clone(),
                agent.name.clone(),
                cancel.clone(),
            )),
        };

        tracing::debug!(agent = %agent.name, tool = %call.name, "executing tool");
        let run = (tool.handler)(call.clone(), ctx);
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return CallResult::canceled(),
            outcome = with_timeout(self.inner.options.tool_timeout, run) => outcome,
        };

        match outcome {
            Some(Ok(result)) => CallResult::plain(result),
            Some(Err(e)) => {
                tracing::warn!(agent = %agent.name, tool = %call.name, "tool failed: {e:#}");
                CallResult::plain(ToolCallResult::error(format!("Error calling tool: {e}")))
            }
            None => CallResult::plain(ToolCallResult::error(format!(
                "Error calling tool: timed out after {}s",
                self.inner.options.tool_timeout.map_or(0, |t| t.as_secs())
            ))),
        }
    }
}

/// `None` when the timeout fires first.
async fn with_timeout<F: std::future::Future>(
    timeout: Option<std::time::Duration>,
    fut: F,
) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn current_agent(&self) -> String {
        read(&self.inner.current_agent).name.clone()
    }

    fn run_stream(&self, cancel: CancellationToken, session: SharedSession) -> EventRx {
        let (tx, rx) = create_event_channel();
        let events = EventSender::new(tx);
        let guard = BusyGuard::acquire(&self.inner);
        let runtime = self.clone();

        tokio::spawn(async move {
            let Some(_guard) = guard else {
                tracing::warn!("run_stream called while a turn is running");
                events
                    .send(Event::error(None, ErrorKind::Internal, BUSY_MESSAGE))
                    .await;
                return;
            };
            runtime.run_turn(&cancel, &session, &events).await;
        });
        rx
    }

    async fn resume(&self, request: ResumeRequest) -> Result<()> {
        tracing::debug!(confirmation = %request.resume_type, "resume");
        self.inner.gate.resume(Decision::Resume(request)).await?;
        Ok(())
    }

    async fn resume_elicitation(&self, action: ElicitationAction, content: Option<Value>) -> Result<()> {
        tracing::debug!(%action, "resume elicitation");
        self.inner
            .gate
            .resume(Decision::Elicitation(ElicitationResponse { action, content }))
            .await?;
        Ok(())
    }

    async fn summarize(
        &self,
        cancel: CancellationToken,
        session: SharedSession,
        additional_prompt: Option<String>,
        events: EventSender,
    ) {
        let Some(_guard) = BusyGuard::acquire(&self.inner) else {
            events
                .send(Event::error(None, ErrorKind::Internal, BUSY_MESSAGE))
                .await;
            return;
        };
        self.compact_session(&cancel, &session, additional_prompt.as_deref(), &events)
            .await;
    }

    async fn close(&self) -> Result<()> {
        if let Some(kind) = self.inner.gate.pending() {
            tracing::debug!(?kind, "closing runtime with a pending suspension");
        }
        Ok(())
    }
}

/// Last assistant text of `session`.
pub(super) fn last_assistant_content(session: &Session) -> String {
    session
        .messages()
        .filter(|m| m.role == Role::Assistant)
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}
