//! HTTP agent backend speaking the `workspace-execute` SSE contract.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream::BoxStream};
use reqwest::{StatusCode, Url, header::ACCEPT};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use workspace_bus_core::{
    AgentBackend, AgentError, AgentEvent, AgentRequest, BusConfig, traits::AgentEventStream,
};

use crate::sse::{SseDecoder, decode_events};

/// Request body of `POST <agent>/workspace-execute`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_context: Option<SearchContext<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchContext<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    current_file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Agent backend reached over HTTP, one endpoint per agent.
#[derive(Debug, Clone)]
pub struct HttpAgentBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentBackend {
    /// Create a backend for agents under `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a backend sharing an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Backend for `config.agent_base_url`.
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.agent_base_url.clone())
    }

    /// `{base}/{agent}/workspace-execute`, with the agent name escaped.
    ///
    /// # Errors
    /// Returns error if the base URL cannot carry a path.
    pub fn endpoint(&self, agent_name: &str) -> Result<Url, AgentError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AgentError::Http(format!("Invalid agent base URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| AgentError::Http(format!("Agent base URL cannot have a path: {}", self.base_url)))?
            .pop_if_empty()
            .push(agent_name)
            .push("workspace-execute");
        Ok(url)
    }
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn execute(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentEventStream, AgentError> {
        let url = self.endpoint(&request.agent_name)?;
        let search_context = (request.current_file.is_some() || request.session_id.is_some())
            .then(|| SearchContext {
                current_file: request.current_file.as_deref(),
                session_id: request.session_id.as_deref(),
            });
        let body = ExecuteBody {
            query: &request.query,
            search_context,
        };

        tracing::debug!(agent = %request.agent_name, %url, "Starting agent execution");
        let send = self
            .client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AgentError::Cancelled),
            response = send => response.map_err(|e| AgentError::Http(e.to_string()))?,
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AgentError::NotFound(request.agent_name));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let body = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("Unknown error").to_string()
            } else {
                body
            };
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(event_stream(response.bytes_stream(), cancel))
    }
}

struct ReadState {
    bytes: BoxStream<'static, Result<Bytes, String>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<AgentEvent, AgentError>>,
    cancel: CancellationToken,
    finished: bool,
}

impl ReadState {
    fn push_data(&mut self, data: &str) {
        self.pending.extend(decode_events(data));
    }
}

/// Turn an SSE body into a stream of agent frames.
///
/// The body is read sequentially, so frames come out in arrival order. Once
/// `cancel` fires the body is dropped and a final [`AgentError::Cancelled`]
/// is yielded.
pub fn event_stream<S, E>(bytes: S, cancel: CancellationToken) -> AgentEventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = ReadState {
        bytes: bytes.map(|r| r.map_err(|e| e.to_string())).boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        cancel,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            tokio::select! {
                biased;
                () = state.cancel.cancelled() => {
                    state.finished = true;
                    state.pending.push_back(Err(AgentError::Cancelled));
                }
                next = state.bytes.next() => match next {
                    Some(Ok(chunk)) => {
                        for data in state.decoder.feed(&chunk) {
                            state.push_data(&data);
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.push_back(Err(AgentError::Stream(e)));
                    }
                    None => {
                        state.finished = true;
                        if let Some(data) = state.decoder.finish() {
                            state.push_data(&data);
                        }
                    }
                },
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use tokio_test::assert_ok;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path},
    };

    use super::*;

    fn request(agent: &str) -> AgentRequest {
        AgentRequest {
            agent_name: agent.to_string(),
            query: "summarize".to_string(),
            session_id: Some("s-1".to_string()),
            current_file: None,
        }
    }

    async fn collect(stream: AgentEventStream) -> Vec<Result<AgentEvent, AgentError>> {
        stream.collect().await
    }

    #[test]
    fn test_endpoint_escapes_agent_name() {
        let backend = HttpAgentBackend::new("http://agents.local/api/agents/");
        let url = backend.endpoint("my agent").unwrap();
        assert_eq!(
            url.as_str(),
            "http://agents.local/api/agents/my%20agent/workspace-execute"
        );
    }

    #[tokio::test]
    async fn test_streams_frames_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"chunk\",\"content\":\"Hel\"}\n\n",
            "data: {\"type\":\"text_delta\",\"text\":\"lo\"}\n\n",
            "data: {\"type\":\"complete\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/agents/writer/workspace-execute"))
            .and(header("accept", "text/event-stream"))
            .and(body_json(serde_json::json!({
                "query": "summarize",
                "searchContext": {"sessionId": "s-1"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpAgentBackend::new(format!("{}/agents", server.uri()));
        let stream = assert_ok!(
            backend
                .execute(request("writer"), CancellationToken::new())
                .await
        );
        let events: Vec<AgentEvent> = collect(stream)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].delta(), Some("Hel"));
        assert_eq!(events[1].delta(), Some("lo"));
        assert_eq!(events[2], AgentEvent::complete(None));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_reported_not_fatal() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"chunk\",\"content\":\"ok\"}\n\n",
            "data: {broken\n\n",
            "data: {\"type\":\"complete\",\"fullResponse\":\"ok\"}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let backend = HttpAgentBackend::new(server.uri());
        let stream = assert_ok!(
            backend
                .execute(request("writer"), CancellationToken::new())
                .await
        );
        let items = collect(stream).await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(e) if e.is_recoverable()));
        assert!(matches!(&items[2], Ok(AgentEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_malformed_line_in_multi_line_event_keeps_valid_frames() {
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {broken\ndata: {\"type\":\"chunk\",\"content\":\"lo\"}\n\ndata: {\"type\":\"complete\"}\n\n",
        ))]);
        let items = collect(event_stream(body, CancellationToken::new())).await;

        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Err(AgentError::Parse(_))));
        assert!(matches!(&items[1], Ok(event) if event.delta() == Some("lo")));
        assert!(matches!(&items[2], Ok(AgentEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let backend = HttpAgentBackend::new(server.uri());
        let Err(err) = backend.execute(request("writer"), CancellationToken::new()).await else {
            panic!("expected a status error");
        };
        assert_eq!(err.to_string(), "Agent backend returned 503: overloaded");
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = HttpAgentBackend::new(server.uri());
        let Err(err) = backend.execute(request("ghost"), CancellationToken::new()).await else {
            panic!("expected NotFound");
        };
        assert!(matches!(err, AgentError::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let backend = HttpAgentBackend::new("http://127.0.0.1:9");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let Err(err) = backend.execute(request("writer"), cancel).await else {
            panic!("expected Cancelled");
        };
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_body() {
        let cancel = CancellationToken::new();
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"type\":\"chunk\",\"content\":\"a\"}\n\n",
        ))])
        .chain(stream::pending());

        let mut events = event_stream(body, cancel.clone());
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.delta(), Some("a"));

        cancel.cancel();
        assert!(matches!(events.next().await, Some(Err(AgentError::Cancelled))));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_body_error_ends_stream() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"chunk\",\"content\":\"a\"}\n\n")),
            Err("connection reset"),
        ]);
        let items = collect(event_stream(body, CancellationToken::new())).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(AgentError::Stream(msg)) if msg == "connection reset"));
    }
}
