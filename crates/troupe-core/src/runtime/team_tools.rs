//! Built-in `handoff` and `transfer_task` tools.
//!
//! Both are read-only from the confirmation point of view and are executed
//! by the runtime itself, since they act on the runtime's agent state.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::local::{CANCELED_TOOL_CALL, LocalRuntime, LoopOutcome, last_assistant_content};
use crate::core::events::{Event, EventSender};
use crate::session::{Message, Session, SessionTemplate, SharedSession};
use crate::team::{Agent, Team};
use crate::tools::{ToolCall, ToolCallResult, ToolDefinition};

pub const HANDOFF_TOOL: &str = "handoff";
pub const TRANSFER_TASK_TOOL: &str = "transfer_task";

const MEMBER_TASK_PREAMBLE: &str =
    "You are a member of a team of agents. Your goal is to complete the following task:";
const IMPLICIT_USER_MESSAGE: &str = "Please proceed.";

#[derive(Debug, Deserialize)]
struct HandoffArgs {
    agent: String,
}

#[derive(Debug, Deserialize)]
struct TransferTaskArgs {
    agent: String,
    task: String,
    #[serde(default)]
    expected_output: String,
}

/// Built-in tool definitions `agent` is entitled to.
pub(super) fn definitions(agent: &Agent) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();
    if !agent.handoffs.is_empty() {
        defs.push(
            ToolDefinition::new(
                HANDOFF_TOOL,
                "Hand off the conversation to another agent. The target agent takes over and answers the user from now on.",
                json!({
                    "type": "object",
                    "properties": {
                        "agent": {
                            "type": "string",
                            "enum": agent.handoffs,
                            "description": "The agent to hand the conversation to"
                        }
                    },
                    "required": ["agent"]
                }),
            )
            .read_only(),
        );
    }
    if !agent.sub_agents.is_empty() {
        defs.push(
            ToolDefinition::new(
                TRANSFER_TASK_TOOL,
                "Transfer a task to a sub-agent. The sub-agent works on it and its final answer is returned as the result.",
                json!({
                    "type": "object",
                    "properties": {
                        "agent": {
                            "type": "string",
                            "enum": agent.sub_agents,
                            "description": "The sub-agent to transfer the task to"
                        },
                        "task": {
                            "type": "string",
                            "description": "A clear, self-contained description of the task"
                        },
                        "expected_output": {
                            "type": "string",
                            "description": "What the result should look like"
                        }
                    },
                    "required": ["agent", "task"]
                }),
            )
            .read_only(),
        );
    }
    defs
}

/// System prompt section listing the agents `agent` can reach.
pub(super) fn team_instructions(team: &Team, agent: &Agent) -> Option<String> {
    if agent.handoffs.is_empty() && agent.sub_agents.is_empty() {
        return None;
    }
    let mut text = String::new();
    let mut section = |header: &str, names: &[String]| {
        if names.is_empty() {
            return;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(header);
        for name in names {
            let description = team.agent(name).map(|a| a.description.clone()).unwrap_or_default();
            let _ = write!(text, "\n- {name}: {description}");
        }
    };
    section(
        "You can hand off the conversation with the handoff tool to these agents:",
        &agent.handoffs,
    );
    section(
        "You are part of a multi-agent team. Use the transfer_task tool to delegate work to these sub-agents:",
        &agent.sub_agents,
    );
    Some(text)
}

fn not_listed(from: &str, to: &str, verb: &str, list: &str, kind: &str, names: &[String]) -> String {
    if names.is_empty() {
        format!("Agent {from} cannot {verb} {to}: target agent not in {list} list. This agent has no {kind}s configured.")
    } else {
        format!(
            "Agent {from} cannot {verb} {to}: target agent not in {list} list. Available {kind} IDs are: {}",
            names.join(", ")
        )
    }
}

/// Switches the runtime's current agent.
pub(super) fn handoff(runtime: &LocalRuntime, agent: &Agent, call: &ToolCall) -> ToolCallResult {
    let args: HandoffArgs = match call.parse_arguments() {
        Ok(args) => args,
        Err(e) => return ToolCallResult::error(format!("invalid arguments: {e:#}")),
    };
    if !agent.handoffs.contains(&args.agent) {
        return ToolCallResult::error(not_listed(
            &agent.name,
            &args.agent,
            "hand off to",
            "handoffs",
            "handoff agent",
            &agent.handoffs,
        ));
    }
    if let Err(e) = runtime.set_current_agent(&args.agent) {
        return ToolCallResult::error(format!("{e:#}"));
    }
    tracing::info!(from = %agent.name, to = %args.agent, "handoff");

    ToolCallResult::success(format!(
        "The agent {} handed off the conversation to you. Your available handoff agents and tools are specified in the system messages that follow. Only use those capabilities; do not attempt to use tools or hand off to agents that you see in the conversation history from previous agents, as those were available to different agents with different capabilities. Complete your part of the task and hand off to the next appropriate agent in your workflow (if any are available to you), or respond directly to the user if you are the final agent.",
        agent.name
    ))
}

/// Runs the sub-agent on a child session and returns its last answer.
pub(super) async fn transfer_task(
    runtime: &LocalRuntime,
    cancel: &CancellationToken,
    session: &SharedSession,
    agent: &Arc<Agent>,
    call: &ToolCall,
    events: &EventSender,
) -> (ToolCallResult, Option<Session>) {
    let args: TransferTaskArgs = match call.parse_arguments() {
        Ok(args) => args,
        Err(e) => return (ToolCallResult::error(format!("invalid arguments: {e:#}")), None),
    };
    if !agent.sub_agents.contains(&args.agent) {
        let message = not_listed(
            &agent.name,
            &args.agent,
            "transfer task to",
            "sub_agents",
            "sub-agent",
            &agent.sub_agents,
        );
        return (ToolCallResult::error(message), None);
    }
    let Some(child_agent) = runtime.team().agent(&args.agent) else {
        return (ToolCallResult::error(format!("agent not found: {}", args.agent)), None);
    };

    let mut task = format!("{MEMBER_TASK_PREAMBLE}\n\n<task>\n{}\n</task>", args.task);
    if !args.expected_output.trim().is_empty() {
        let _ = write!(task, "\n\n<expected_output>\n{}\n</expected_output>", args.expected_output);
    }

    let child = {
        let parent = session.lock().await;
        let mut child = Session::from_template(&SessionTemplate {
            title: "Transferred task".to_string(),
            tools_approved: parent.tools_approved,
            working_dir: parent.working_dir.clone(),
            ..SessionTemplate::default()
        });
        child.parent_id = Some(parent.id.clone());
        child.add_message(Message::system(task));
        child.add_user_message(IMPLICIT_USER_MESSAGE);
        child.into_shared()
    };

    tracing::debug!(from = %agent.name, to = %child_agent.name, "transferring task");
    events
        .send(Event::AgentSwitching {
            switching: true,
            from_agent: agent.name.clone(),
            to_agent: child_agent.name.clone(),
        })
        .await;
    events
        .send(Event::AgentInfo {
            agent_name: child_agent.name.clone(),
            model: runtime.model_for(&child_agent).id(),
            description: child_agent.description.clone(),
        })
        .await;

    let outcome = runtime
        .run_loop(cancel, &child, events, Some(Arc::clone(&child_agent)))
        .await;

    events
        .send(Event::AgentSwitching {
            switching: false,
            from_agent: child_agent.name.clone(),
            to_agent: agent.name.clone(),
        })
        .await;
    events
        .send(Event::AgentInfo {
            agent_name: agent.name.clone(),
            model: runtime.model_for(agent).id(),
            description: agent.description.clone(),
        })
        .await;

    let child = child.lock().await.clone();
    if child.tools_approved {
        session.lock().await.tools_approved = true;
    }

    let result = match outcome {
        LoopOutcome::Failed(message) => ToolCallResult::error(message),
        LoopOutcome::Canceled => ToolCallResult::error(CANCELED_TOOL_CALL),
        LoopOutcome::Completed | LoopOutcome::Stopped => {
            ToolCallResult::success(last_assistant_content(&child))
        }
    };
    (result, Some(child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ScriptedProvider;

    fn agent(name: &str) -> Agent {
        Agent::new(name, Arc::new(ScriptedProvider::new("scripted/m")))
    }

    #[test]
    fn test_definitions_follow_team_links() {
        assert!(definitions(&agent("solo")).is_empty());

        let lead = agent("lead").with_handoffs(["a"]).with_sub_agents(["b"]);
        let names: Vec<String> = definitions(&lead).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec![HANDOFF_TOOL, TRANSFER_TASK_TOOL]);
        assert!(definitions(&lead).iter().all(ToolDefinition::is_read_only));
    }

    #[test]
    fn test_not_listed_messages() {
        let names = ["a".to_string(), "b".to_string()];
        assert_eq!(
            not_listed("root", "x", "hand off to", "handoffs", "handoff agent", &names),
            "Agent root cannot hand off to x: target agent not in handoffs list. Available handoff agent IDs are: a, b"
        );
        assert_eq!(
            not_listed("root", "x", "hand off to", "handoffs", "handoff agent", &[]),
            "Agent root cannot hand off to x: target agent not in handoffs list. This agent has no handoff agents configured."
        );
    }

    #[test]
    fn test_team_instructions_lists_descriptions() {
        let team = Team::new(vec![
            agent("root").with_sub_agents(["coder"]),
            agent("coder").with_description("Writes code"),
        ])
        .unwrap();
        let root = team.agent("root").unwrap();
        let text = team_instructions(&team, &root).unwrap();
        assert!(text.contains("- coder: Writes code"));
        assert!(team_instructions(&team, &team.agent("coder").unwrap()).is_none());
    }
}
