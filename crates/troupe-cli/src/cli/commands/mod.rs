//! CLI command handlers.

pub mod compact;
pub mod model;
pub mod run;
pub mod serve;
pub mod sessions;

use std::sync::Arc;

use anyhow::{Context, Result};
use troupe_core::config::paths;
use troupe_core::session::{JsonFileSessionStore, Session, SessionStore, resolve_session_id};

/// The session store under `$TROUPE_HOME/sessions`.
fn open_store() -> Result<Arc<dyn SessionStore>> {
    let store = JsonFileSessionStore::open(paths::sessions_dir()).context("open session store")?;
    Ok(Arc::new(store))
}

/// Loads the session `reference` points at.
async fn load_session(store: &dyn SessionStore, reference: &str) -> Result<Session> {
    let id = resolve_session_id(store, reference)
        .await
        .with_context(|| format!("resolve session '{reference}'"))?;
    store
        .get_session(&id)
        .await
        .with_context(|| format!("load session '{id}'"))
}
