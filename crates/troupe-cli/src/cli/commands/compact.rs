//! Compact command handler.

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use troupe_core::config::Config;
use troupe_core::core::events::{Event, EventSender, create_event_channel};
use troupe_core::core::interrupt::{self, InterruptedError};
use troupe_core::runtime::{PersistentRuntime, Runtime, local_from_config};

use super::{load_session, open_store};

pub async fn run(config: &Config, reference: &str, instructions: Option<String>) -> Result<()> {
    let store = open_store()?;
    let session = load_session(store.as_ref(), reference).await?.into_shared();
    let runtime = PersistentRuntime::new(local_from_config(config, None).context("build runtime")?, store);

    let cancel = CancellationToken::new();
    let bridge = interrupt::cancel_on_interrupt(cancel.clone());
    let (tx, mut rx) = create_event_channel();
    let summarize = runtime.summarize(cancel.clone(), session, instructions, EventSender::new(tx));
    let collect = async {
        let mut outcome = Err(anyhow!("no summary was produced"));
        while let Some(event) = rx.recv().await {
            match event {
                Event::SessionSummary { summary, .. } => outcome = Ok(summary),
                Event::Warning { message, .. } => outcome = Err(anyhow!(message)),
                Event::Error { message, .. } => outcome = Err(anyhow!(message)),
                _ => {}
            }
        }
        outcome
    };
    let ((), outcome) = tokio::join!(summarize, collect);
    bridge.abort();

    if cancel.is_cancelled() {
        return Err(InterruptedError.into());
    }
    println!("{}", outcome?);
    Ok(())
}
