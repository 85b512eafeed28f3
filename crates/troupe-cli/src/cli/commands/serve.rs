//! Serve command handler.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use troupe_core::config::Config;
use troupe_core::core::interrupt;
use troupe_core::remote::server::RuntimeFactory;
use troupe_core::remote::{ServerState, serve};
use troupe_core::runtime::local_from_config;

use super::open_store;

pub async fn run(config: &Config, listen: Option<&str>) -> Result<()> {
    // Fail on a broken team before binding.
    local_from_config(config, None).context("build runtime")?;

    let team_config = config.clone();
    let factory: RuntimeFactory = Arc::new(move || local_from_config(&team_config, None));
    let state = ServerState::new(open_store()?, factory);

    let addr = listen.unwrap_or(&config.server.listen);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let local_addr = listener.local_addr().context("read listen address")?;
    eprintln!("Listening on http://{local_addr}");

    let shutdown = state.shutdown_token();
    tokio::spawn(async move {
        interrupt::wait_for_interrupt().await;
        tracing::info!("shutting down");
        shutdown.cancel();
    });

    serve(listener, state).await
}
