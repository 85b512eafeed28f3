//! Single-slot suspend/resume gate.
//!
//! The loop registers a suspension *before* emitting the matching
//! suspend-class event, then waits on it. A resume call takes the slot,
//! hands the decision over and waits until the loop acknowledges it, so a
//! second resume can never race the loop's state transition.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::events::EventSender;
use crate::tools::ElicitationResponse;

/// Decision for a tool confirmation or an iteration-limit suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeType {
    /// Run this call (or continue past the iteration limit).
    Approve,
    /// Run this call and skip confirmation for the rest of the session.
    ApproveSession,
    /// Decline this call (or stop at the iteration limit).
    Reject,
}

impl fmt::Display for ResumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeType::Approve => write!(f, "approve"),
            ResumeType::ApproveSession => write!(f, "approve-session"),
            ResumeType::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRequest {
    #[serde(rename = "confirmation")]
    pub resume_type: ResumeType,
    /// Optional explanation, forwarded to the model on reject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResumeRequest {
    pub fn new(resume_type: ResumeType) -> Self {
        Self {
            resume_type,
            reason: None,
        }
    }

    pub fn approve() -> Self {
        Self::new(ResumeType::Approve)
    }

    pub fn approve_session() -> Self {
        Self::new(ResumeType::ApproveSession)
    }

    pub fn reject(reason: Option<String>) -> Self {
        Self {
            resume_type: ResumeType::Reject,
            reason,
        }
    }
}

/// What the loop is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendKind {
    ToolConfirmation,
    MaxIterations,
    Elicitation,
}

/// A decision delivered through the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Resume(ResumeRequest),
    Elicitation(ElicitationResponse),
}

impl Decision {
    fn accepts(&self, kind: SuspendKind) -> bool {
        match self {
            Decision::Resume(_) => matches!(
                kind,
                SuspendKind::ToolConfirmation | SuspendKind::MaxIterations
            ),
            Decision::Elicitation(_) => kind == SuspendKind::Elicitation,
        }
    }

    fn not_pending(&self) -> ResumeError {
        match self {
            Decision::Resume(_) => ResumeError::NoDecisionPending,
            Decision::Elicitation(_) => ResumeError::NoElicitationPending,
        }
    }
}

/// Resume-protocol misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeError {
    /// `resume` was called while no confirmation or iteration limit is pending.
    NoDecisionPending,
    /// `resume_elicitation` was called while no elicitation is pending.
    NoElicitationPending,
    /// The loop tried to suspend twice.
    AlreadySuspended,
}

impl fmt::Display for ResumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeError::NoDecisionPending => {
                write!(f, "nothing to resume: no tool confirmation or iteration limit is pending")
            }
            ResumeError::NoElicitationPending => write!(f, "no elicitation request in progress"),
            ResumeError::AlreadySuspended => write!(f, "runtime is already suspended"),
        }
    }
}

impl std::error::Error for ResumeError {}

struct Delivery {
    decision: Decision,
    ack: oneshot::Sender<()>,
}

struct Pending {
    id: u64,
    kind: SuspendKind,
    tx: oneshot::Sender<Delivery>,
}

#[derive(Default)]
pub struct ResumeGate {
    slot: Mutex<Option<Pending>>,
    next_id: AtomicU64,
}

impl ResumeGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slot(&self) -> MutexGuard<'_, Option<Pending>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What the loop is waiting for, if anything.
    pub fn pending(&self) -> Option<SuspendKind> {
        self.slot().as_ref().map(|p| p.kind)
    }

    /// Occupies the slot. Must be called before the suspend event is emitted.
    ///
    /// # Errors
    /// Returns `AlreadySuspended` if another suspension is outstanding.
    pub fn suspend(self: &Arc<Self>, kind: SuspendKind) -> Result<Suspension, ResumeError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(ResumeError::AlreadySuspended);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *slot = Some(Pending { id, kind, tx });
        Ok(Suspension {
            gate: Arc::clone(self),
            id,
            rx: Some(rx),
        })
    }

    /// Hands `decision` to the waiting loop and returns once the loop has
    /// acknowledged it.
    ///
    /// # Errors
    /// Fails without touching the slot when nothing matching is pending.
    pub async fn resume(&self, decision: Decision) -> Result<(), ResumeError> {
        let pending = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(p) if decision.accepts(p.kind) => slot.take(),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return Err(decision.not_pending());
        };

        let not_pending = decision.not_pending();
        let (ack_tx, ack_rx) = oneshot::channel();
        if pending
            .tx
            .send(Delivery {
                decision,
                ack: ack_tx,
            })
            .is_err()
        {
            // The waiter went away (cancelled) between take and send.
            return Err(not_pending);
        }
        // Resolves on ack or when the loop drops the ack handle.
        let _ = ack_rx.await;
        Ok(())
    }
}

/// A registered suspension. Dropping it frees the slot.
pub struct Suspension {
    gate: Arc<ResumeGate>,
    id: u64,
    rx: Option<oneshot::Receiver<Delivery>>,
}

/// A decision received by the loop, plus the handle that releases the resumer.
pub struct Resumed {
    pub decision: Decision,
    ack: oneshot::Sender<()>,
}

impl Resumed {
    /// Signals the resumer that the decision has been applied.
    pub fn ack(self) -> Decision {
        let _ = self.ack.send(());
        self.decision
    }
}

impl Suspension {
    /// Waits for a decision. Returns `None` when `cancel` fires first or
    /// when nobody is left reading `events` to answer.
    pub async fn wait(mut self, cancel: &CancellationToken, events: &EventSender) -> Option<Resumed> {
        let rx = self.rx.take()?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            () = events.closed() => {
                tracing::debug!("event receiver dropped while suspended");
                None
            }
            delivery = rx => delivery.ok().map(|d| Resumed {
                decision: d.decision,
                ack: d.ack,
            }),
        }
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        let mut slot = self.gate.slot();
        if slot.as_ref().is_some_and(|p| p.id == self.id) {
            *slot = None;
        }
    }
}
