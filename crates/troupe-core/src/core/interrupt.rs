//! Ctrl+C handling for drivers of the runtime.
//!
//! The handler only flips a flag and wakes waiters. Drivers bridge it into a
//! turn's `CancellationToken` with [`cancel_on_interrupt`], so the loop
//! itself only ever observes token cancellation.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_NOTIFY: OnceLock<Notify> = OnceLock::new();

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Installs the Ctrl+C handler.
///
/// A second Ctrl+C while the first is still pending exits the process with
/// status 130.
///
/// # Errors
/// Returns an error if a handler is already registered for this process.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger_ctrl_c).context("setting Ctrl+C handler")
}

fn notify() -> &'static Notify {
    INTERRUPT_NOTIFY.get_or_init(Notify::new)
}

/// Triggers an interrupt as if Ctrl+C was pressed.
pub fn trigger_ctrl_c() {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(130);
    }
    notify().notify_waiters();
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Waits until an interrupt is triggered.
pub async fn wait_for_interrupt() {
    loop {
        let notified = notify().notified();
        if is_interrupted() {
            return;
        }
        notified.await;
    }
}

/// Resets the interrupt flag.
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Cancels `token` on the next interrupt.
///
/// The returned task ends either way; abort it once the turn is over.
pub fn cancel_on_interrupt(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = token.cancelled() => {}
            () = wait_for_interrupt() => {
                tracing::debug!("interrupt received, cancelling turn");
                token.cancel();
                reset();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    /// Verifies an interrupt cancels the bridged token and clears the flag.
    #[tokio::test]
    async fn test_interrupt_cancels_token() {
        let token = CancellationToken::new();
        let handle = cancel_on_interrupt(token.clone());
        tokio::task::yield_now().await;

        INTERRUPTED.store(true, Ordering::SeqCst);
        notify().notify_waiters();

        timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("token should be cancelled");
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("bridge task should finish")
            .unwrap();
        assert!(!is_interrupted());
    }
}
