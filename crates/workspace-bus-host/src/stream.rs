//! Forwarding one agent execution to the embedded caller.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use workspace_bus_core::{AgentBackend, AgentError, AgentEvent, AgentRequest, BusError};
use workspace_bus_transport::Reply;

use crate::connection::Replier;

/// Everything one spawned execution needs.
pub struct AgentCall {
    pub request_id: String,
    pub request: AgentRequest,
    pub backend: Arc<dyn AgentBackend>,
    pub replier: Replier,
    pub cancel: CancellationToken,
}

/// Run `call` to completion and send exactly one terminal reply.
pub async fn run_agent(call: AgentCall) {
    let terminal = stream_agent(&call).await;
    let reply = Reply::ExecuteAgentResponse {
        request_id: call.request_id.clone(),
        payload: terminal,
    };
    if call.replier.send(&reply).is_err() {
        tracing::debug!(request_id = %call.request_id, "Caller gone before terminal reply");
    }
}

/// Drive the backend stream, forwarding text frames as they arrive.
///
/// Returns the terminal frame; never sends it.
async fn stream_agent(call: &AgentCall) -> AgentEvent {
    let request_id = call.request_id.as_str();
    let agent = call.request.agent_name.clone();

    let mut events = match call
        .backend
        .execute(call.request.clone(), call.cancel.clone())
        .await
    {
        Ok(events) => events,
        Err(e) => return terminal_error(request_id, e),
    };

    let mut accumulated = String::new();
    loop {
        let next = tokio::select! {
            biased;
            () = call.cancel.cancelled() => return terminal_error(request_id, AgentError::Cancelled),
            next = events.next() => next,
        };

        let event = match next {
            None => {
                tracing::debug!(request_id, %agent, "Stream ended without terminal frame");
                return AgentEvent::complete(Some(accumulated));
            }
            Some(Err(e)) if e.is_recoverable() => {
                tracing::warn!(request_id, %agent, error = %e, "Skipping malformed agent frame");
                continue;
            }
            Some(Err(e)) => return terminal_error(request_id, e),
            Some(Ok(event)) => event,
        };

        match event {
            AgentEvent::Complete { full_response } => {
                tracing::debug!(request_id, %agent, chars = accumulated.len(), "Agent execution complete");
                return AgentEvent::complete(Some(full_response.unwrap_or(accumulated)));
            }
            AgentEvent::Error { .. } => {
                tracing::warn!(request_id, %agent, error = ?event.error_message(), "Agent reported error");
                return AgentEvent::error(event.error_message().unwrap_or_default());
            }
            AgentEvent::Other => {}
            AgentEvent::Chunk { .. } | AgentEvent::TextDelta { .. } => {
                let Some(delta) = event.delta() else { continue };
                accumulated.push_str(delta);
                let reply = Reply::ExecuteAgentResponse {
                    request_id: request_id.to_owned(),
                    payload: event,
                };
                if call.replier.send(&reply).is_err() {
                    // Nobody to forward to; tear the backend call down.
                    call.cancel.cancel();
                }
            }
        }
    }
}

fn terminal_error(request_id: &str, err: AgentError) -> AgentEvent {
    if matches!(err, AgentError::Cancelled) {
        tracing::info!(request_id, "Agent execution cancelled");
    } else {
        tracing::warn!(request_id, error = %err, "Agent execution failed");
    }
    AgentEvent::error(BusError::from(err).to_string())
}
