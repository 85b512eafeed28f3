//! Session command handlers.

use anyhow::{Context, Result};
use troupe_core::session::{Item, Role, Session, SessionStore, resolve_session_id};

use super::{load_session, open_store};

pub async fn list() -> Result<()> {
    let store = open_store()?;
    let summaries = store
        .get_session_summaries()
        .await
        .context("list sessions")?;
    if summaries.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }
    for summary in summaries {
        let title = if summary.title.is_empty() {
            "(untitled)"
        } else {
            summary.title.as_str()
        };
        println!(
            "{}  {}  {}  {} messages",
            summary.id,
            summary.created_at.format("%Y-%m-%d %H:%M"),
            title,
            summary.message_count
        );
    }
    Ok(())
}

pub async fn show(reference: &str) -> Result<()> {
    let store = open_store()?;
    let session = load_session(store.as_ref(), reference).await?;
    print!("{}", transcript(&session));
    Ok(())
}

pub async fn delete(reference: &str) -> Result<()> {
    let store = open_store()?;
    let id = resolve_session_id(store.as_ref(), reference)
        .await
        .with_context(|| format!("resolve session '{reference}'"))?;
    store
        .delete_session(&id)
        .await
        .with_context(|| format!("delete session '{id}'"))?;
    println!("Deleted session {id}");
    Ok(())
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Plain-text rendering of a session log.
fn transcript(session: &Session) -> String {
    let mut out = format!("# {}\n", session.id);
    if !session.title.is_empty() {
        out.push_str(&format!("title: {}\n", session.title));
    }
    out.push_str(&format!(
        "tokens: {} in / {} out\n",
        session.input_tokens, session.output_tokens
    ));
    for (agent, model) in &session.agent_model_overrides {
        out.push_str(&format!("model override: {agent} = {model}\n"));
    }

    for item in &session.items {
        out.push('\n');
        match item {
            Item::Message { message } => {
                let label = role_label(message.role);
                match &message.agent_name {
                    Some(agent) if message.role != Role::User => {
                        out.push_str(&format!("[{label} {agent}]\n"));
                    }
                    _ => out.push_str(&format!("[{label}]\n")),
                }
                for call in &message.tool_calls {
                    out.push_str(&format!("-> {}({})\n", call.name, call.arguments));
                }
                if !message.content.is_empty() {
                    out.push_str(&message.content);
                    out.push('\n');
                }
            }
            Item::Summary { summary } => {
                out.push_str("[summary]\n");
                out.push_str(summary);
                out.push('\n');
            }
            Item::SubSession { session } => {
                out.push_str(&format!(
                    "[sub-session {}: {} messages]\n",
                    session.id,
                    session.messages().count()
                ));
            }
        }
    }
    out
}
