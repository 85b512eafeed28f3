//! Run command handler.

use anyhow::{Context, Result};
use troupe_core::config::Config;
use troupe_core::remote::{RemoteClient, RemoteRuntime};
use troupe_core::runtime::{PersistentRuntime, Runtime, local_from_config};
use troupe_core::session::{Session, SessionTemplate};

use super::{load_session, open_store};
use crate::modes::exec::{Prompter, run_turn};

pub struct RunOptions<'a> {
    pub config: &'a Config,
    pub agent: Option<&'a str>,
    pub session: Option<&'a str>,
    pub remote: Option<&'a str>,
    pub yolo: bool,
    pub max_iterations: Option<u32>,
    pub prompt: &'a str,
}

impl RunOptions<'_> {
    fn apply(&self, session: &mut Session) {
        if self.yolo {
            session.tools_approved = true;
        }
        if let Some(max) = self.max_iterations {
            session.max_iterations = max;
        }
        session.add_user_message(self.prompt);
    }
}

fn new_session() -> Result<Session> {
    let working_dir = std::env::current_dir().context("resolve working directory")?;
    Ok(Session::from_template(&SessionTemplate {
        working_dir: Some(working_dir),
        ..SessionTemplate::default()
    }))
}

pub async fn run(options: RunOptions<'_>) -> Result<()> {
    if options.prompt.trim().is_empty() {
        anyhow::bail!("prompt cannot be empty");
    }
    match options.remote {
        Some(url) => run_remote(&options, url).await,
        None => run_local(&options).await,
    }
}

async fn run_local(options: &RunOptions<'_>) -> Result<()> {
    let store = open_store()?;
    let mut session = match options.session {
        Some(reference) => load_session(store.as_ref(), reference).await?,
        None => new_session()?,
    };
    options.apply(&mut session);

    let local = local_from_config(options.config, options.agent).context("build runtime")?;
    let runtime = PersistentRuntime::new(local, store);
    tracing::info!(session_id = %session.id, agent = %runtime.current_agent(), "running turn");

    let result = run_turn(&runtime, session.into_shared(), &mut Prompter::stdin()).await;
    runtime.local().team().stop_tool_sets().await;
    runtime.close().await?;
    result
}

async fn run_remote(options: &RunOptions<'_>, url: &str) -> Result<()> {
    let client = RemoteClient::new(url)?;
    let mut session = match options.session {
        Some(reference) => client
            .get_session(reference)
            .await
            .with_context(|| format!("load remote session '{reference}'"))?,
        None => new_session()?,
    };
    options.apply(&mut session);

    let runtime = RemoteRuntime::new(client);
    if let Some(agent) = options.agent {
        runtime.set_current_agent(agent);
    }
    tracing::info!(session_id = %session.id, remote = %url, "running remote turn");

    let result = run_turn(&runtime, session.into_shared(), &mut Prompter::stdin()).await;
    runtime.close().await?;
    result
}
