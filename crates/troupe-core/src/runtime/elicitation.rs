//! Bridges tool elicitation requests onto the runtime's suspend protocol.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::events::{Event, EventSender};
use crate::core::resume::{Decision, ResumeGate, SuspendKind};
use crate::tools::{ElicitationAction, ElicitationRequest, ElicitationResponse};

/// Handed to tools through [`crate::tools::ToolContext`].
#[derive(Clone)]
pub struct ElicitationHandle {
    gate: Arc<ResumeGate>,
    events: EventSender,
    agent_name: String,
    cancel: CancellationToken,
}

impl fmt::Debug for ElicitationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElicitationHandle")
            .field("agent_name", &self.agent_name)
            .finish_non_exhaustive()
    }
}

impl ElicitationHandle {
    pub(crate) fn new(
        gate: Arc<ResumeGate>,
        events: EventSender,
        agent_name: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gate,
            events,
            agent_name: agent_name.into(),
            cancel,
        }
    }

    /// Emits `elicitation_request` and waits for `resume_elicitation`.
    ///
    /// A cancelled turn answers with [`ElicitationAction::Cancel`].
    ///
    /// # Errors
    /// Fails when another suspension is already outstanding.
    pub async fn elicit(&self, request: ElicitationRequest) -> Result<ElicitationResponse> {
        let suspension = self.gate.suspend(SuspendKind::Elicitation)?;
        let elicitation_id = Uuid::new_v4().to_string();
        tracing::debug!(agent = %self.agent_name, %elicitation_id, "waiting for elicitation response");
        self.events
            .send(Event::ElicitationRequest {
                agent_name: self.agent_name.clone(),
                message: request.message,
                mode: request.mode,
                schema: request.schema,
                url: request.url,
                elicitation_id,
                meta: request.meta,
            })
            .await;

        let Some(resumed) = suspension.wait(&self.cancel, &self.events).await else {
            return Ok(ElicitationResponse::new(ElicitationAction::Cancel));
        };
        match resumed.ack() {
            Decision::Elicitation(response) => Ok(response),
            Decision::Resume(_) => Ok(ElicitationResponse::new(ElicitationAction::Cancel)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::core::events::create_event_channel;

    /// Verifies a tool blocks until the caller answers and receives the payload.
    #[tokio::test]
    async fn test_elicit_round_trip() {
        let gate = ResumeGate::new();
        let (tx, mut rx) = create_event_channel();
        let handle = ElicitationHandle::new(gate.clone(), EventSender::new(tx), "root", CancellationToken::new());

        let task = tokio::spawn(async move {
            handle
                .elicit(ElicitationRequest {
                    message: "Pick a color".to_string(),
                    ..Default::default()
                })
                .await
        });

        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(event.is_suspend());
        assert_eq!(gate.pending(), Some(SuspendKind::Elicitation));

        let mut response = ElicitationResponse::new(ElicitationAction::Accept);
        response.content = Some(json!({"color": "blue"}));
        gate.resume(Decision::Elicitation(response.clone())).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), response);
        assert_eq!(gate.pending(), None);
    }

    /// Verifies cancellation unblocks the tool with a cancel answer.
    #[tokio::test]
    async fn test_cancel_answers_cancel() {
        let gate = ResumeGate::new();
        let (tx, _rx) = create_event_channel();
        let cancel = CancellationToken::new();
        let handle = ElicitationHandle::new(gate.clone(), EventSender::new(tx), "root", cancel.clone());

        let task = tokio::spawn(async move { handle.elicit(ElicitationRequest::default()).await });
        tokio::task::yield_now().await;
        cancel.cancel();

        let response = timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
        assert_eq!(response.action, ElicitationAction::Cancel);
        assert_eq!(gate.pending(), None);
    }
}
