//! Model command handler.

use anyhow::{Context, Result};
use troupe_core::config::Config;
use troupe_core::runtime::{PersistentRuntime, local_from_config};

use super::{load_session, open_store};

pub async fn run(config: &Config, reference: &str, agent: &str, model: &str) -> Result<()> {
    let store = open_store()?;
    let session = load_session(store.as_ref(), reference).await?;
    let id = session.id.clone();
    let session = session.into_shared();

    let runtime = PersistentRuntime::new(local_from_config(config, None).context("build runtime")?, store);
    runtime
        .set_agent_model(&session, agent, model)
        .await
        .with_context(|| format!("set model for agent '{agent}'"))?;

    if model.trim().is_empty() {
        println!("Restored default model for {agent} in session {id}");
    } else {
        println!("Set model for {agent} to {} in session {id}", model.trim());
    }
    Ok(())
}
