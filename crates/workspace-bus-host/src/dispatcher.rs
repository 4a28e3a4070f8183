//! Host RPC dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use workspace_bus_core::{
    AgentBackend, ContextProvider, FileError, FileLoader, Navigator, Store,
};
use workspace_bus_transport::{OriginPolicy, PortHandler, PortReceiver, PortSender};

use crate::connection::Connection;

/// Routes requests from embedded content to host capabilities.
///
/// One dispatcher serves any number of connections; they all share the same
/// store and context. Each connection gets its own subscriptions and
/// in-flight table.
pub struct Dispatcher {
    pub(crate) store: Store,
    pub(crate) context: ContextProvider,
    pub(crate) backend: Arc<dyn AgentBackend>,
    pub(crate) files: Arc<dyn FileLoader>,
    pub(crate) navigator: Arc<dyn Navigator>,
    pub(crate) policy: Arc<OriginPolicy>,
}

impl Dispatcher {
    /// Create a dispatcher. Files and navigation are unavailable until set.
    #[must_use]
    pub fn new(store: Store, backend: Arc<dyn AgentBackend>, policy: OriginPolicy) -> Self {
        Self {
            store,
            context: ContextProvider::default(),
            backend,
            files: Arc::new(NoFiles),
            navigator: Arc::new(LogNavigator),
            policy: Arc::new(policy),
        }
    }

    /// Use `context` as the snapshot source.
    #[must_use]
    pub fn with_context(mut self, context: ContextProvider) -> Self {
        self.context = context;
        self
    }

    /// Serve `load-file` requests from `files`.
    #[must_use]
    pub fn with_files(mut self, files: Arc<dyn FileLoader>) -> Self {
        self.files = files;
        self
    }

    /// Hand `navigate` requests to `navigator`.
    #[must_use]
    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    /// The shared store.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// The context provider collaborators update.
    #[must_use]
    pub const fn context(&self) -> &ContextProvider {
        &self.context
    }

    /// Serve one connection until its receiver closes.
    ///
    /// On return every subscription made through the connection is released
    /// and every agent execution it started is cancelled.
    pub async fn serve(&self, sender: PortSender, mut receiver: PortReceiver) {
        let origin = sender.target_origin().to_owned();
        let mut connection = Connection::new(self, sender);
        tracing::debug!(%origin, "Dispatcher connection started");

        while let Some(frame) = receiver.recv().await {
            if !self.policy.accepts(&frame) {
                tracing::warn!(origin = %frame.origin, "Dropping frame from untrusted origin");
                continue;
            }
            connection.handle(frame.data);
        }

        connection.shutdown();
        tracing::debug!(%origin, "Dispatcher connection ended");
    }
}

#[async_trait]
impl PortHandler for Dispatcher {
    async fn serve(&self, sender: PortSender, receiver: PortReceiver) {
        Self::serve(self, sender, receiver).await;
    }
}

/// Loader used until a real one is configured.
struct NoFiles;

#[async_trait]
impl FileLoader for NoFiles {
    async fn load(&self, path: &str) -> Result<String, FileError> {
        Err(FileError::NotFound(path.to_owned()))
    }
}

/// Navigator used until a real one is configured.
struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, path: &str) {
        tracing::info!(path, "Navigation requested but no router is attached");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use futures::{StreamExt, stream};
    use serde_json::{Value, json};
    use tokio::task::JoinHandle;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;
    use workspace_bus_core::{
        AgentError, AgentEvent, AgentRequest, WorkspaceContext,
        traits::{AgentEventStream, ChannelNavigator},
    };
    use workspace_bus_transport::{Port, pair};

    use super::*;

    const HOST: &str = "https://host.example";
    const EMBED: &str = "https://embed.example";

    /// Backend that replays a fixed script and records what it was asked.
    #[derive(Default)]
    struct ScriptedBackend {
        frames: Vec<Result<AgentEvent, AgentError>>,
        hang: bool,
        requests: Mutex<Vec<AgentRequest>>,
        cancels: Mutex<Vec<CancellationToken>>,
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn execute(
            &self,
            request: AgentRequest,
            cancel: CancellationToken,
        ) -> Result<AgentEventStream, AgentError> {
            if request.agent_name == "missing" {
                return Err(AgentError::NotFound(request.agent_name));
            }
            self.requests.lock().unwrap().push(request);
            self.cancels.lock().unwrap().push(cancel);
            let frames: Vec<_> = self
                .frames
                .iter()
                .map(|f| match f {
                    Ok(e) => Ok(e.clone()),
                    Err(e) => Err(AgentError::Parse(e.to_string())),
                })
                .collect();
            let script = stream::iter(frames);
            if self.hang {
                Ok(script.chain(stream::pending()).boxed())
            } else {
                Ok(script.boxed())
            }
        }
    }

    struct Harness {
        embed: Port,
        store: Store,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(dispatcher: Dispatcher) -> Self {
            let (host, embed) = pair(HOST, EMBED);
            let store = dispatcher.store().clone();
            let task = tokio::spawn(async move {
                dispatcher.serve(host.sender, host.receiver).await;
            });
            Self { embed, store, task }
        }

        fn send(&self, message: Value) {
            assert_ok!(self.embed.sender.post(&message));
        }

        async fn next(&mut self) -> Value {
            tokio::time::timeout(Duration::from_secs(5), self.embed.receiver.recv())
                .await
                .expect("no reply within 5s")
                .expect("channel closed")
                .data
        }

        async fn silent(&mut self) {
            let got = tokio::time::timeout(Duration::from_millis(50), self.embed.receiver.recv()).await;
            assert!(got.is_err(), "unexpected frame: {got:?}");
        }
    }

    fn dispatcher(backend: ScriptedBackend) -> Dispatcher {
        Dispatcher::new(Store::new(), Arc::new(backend), OriginPolicy::new([EMBED]))
    }

    fn chunks(parts: &[&str]) -> Vec<Result<AgentEvent, AgentError>> {
        parts.iter().map(|p| Ok(AgentEvent::chunk(*p))).collect()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));
        h.send(json!({
            "type": "workspace-set-data",
            "payload": {"key": "x", "value": {"a": 1}, "source": "agentA"},
            "requestId": "r1"
        }));
        assert_eq!(
            h.next().await,
            json!({"type": "workspace-set-data-response", "requestId": "r1", "success": true})
        );

        h.send(json!({"type": "workspace-get-data", "payload": {"key": "x"}, "requestId": "r2"}));
        let reply = h.next().await;
        assert_eq!(reply["type"], "workspace-get-data-response");
        assert_eq!(reply["requestId"], "r2");
        assert_eq!(reply["found"], true);
        assert_eq!(reply["data"]["value"], json!({"a": 1}));
        assert_eq!(reply["data"]["source"], "agentA");
        assert_eq!(reply["data"]["loading"], false);
        assert_eq!(h.store.get_data("x").value, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_get_absent_key() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));
        h.send(json!({"type": "workspace-get-data", "payload": {"key": "nope"}, "requestId": "r"}));
        let reply = h.next().await;
        assert_eq!(reply["found"], false);
        assert_eq!(reply["data"]["value"], Value::Null);
    }

    #[tokio::test]
    async fn test_versioned_set_conflict() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));
        h.store.set_data("doc", json!("v1"), None);
        h.send(json!({
            "type": "workspace-set-data",
            "payload": {"key": "doc", "value": "v2", "expectedVersion": 0},
            "requestId": "r"
        }));
        let reply = h.next().await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "Version conflict on 'doc': expected 0, found 1");
        assert_eq!(h.store.get_data("doc").value, Some(json!("v1")));
    }

    #[tokio::test]
    async fn test_subscription_forwards_changes_until_unsubscribed() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));
        h.send(json!({"type": "workspace-subscribe", "payload": {"key": "k"}}));
        h.send(json!({"type": "workspace-subscribe", "payload": {"key": "k"}}));
        // Round trip so both subscribe frames are processed.
        h.send(json!({"type": "workspace-get-context", "requestId": "sync"}));
        assert_eq!(h.next().await["requestId"], "sync");
        assert_eq!(h.store.subscriber_count("k"), 1);

        h.store.set_data("k", json!(1), Some("host"));
        h.store.set_error("k", Some("stale"));
        let first = h.next().await;
        assert_eq!(first["type"], "workspace-data-changed");
        assert_eq!(first["key"], "k");
        assert_eq!(first["dataState"]["value"], 1);
        let second = h.next().await;
        assert_eq!(second["dataState"]["error"], "stale");
        assert_eq!(second["dataState"]["value"], 1);

        h.send(json!({"type": "workspace-unsubscribe", "payload": {"key": "k"}}));
        h.send(json!({"type": "workspace-get-context", "requestId": "sync2"}));
        assert_eq!(h.next().await["requestId"], "sync2");
        h.store.set_data("k", json!(2), None);
        h.silent().await;
        assert_eq!(h.store.subscriber_count("k"), 0);
    }

    #[tokio::test]
    async fn test_late_notification_of_older_version_is_dropped() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));

        // Registered ahead of the connection, so it runs first and can hold
        // the v1 writer between the store update and the connection callback.
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let _gate = h.store.subscribe("k", move |state| {
            if state.version == 1 {
                entered_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
        });

        h.send(json!({"type": "workspace-subscribe", "payload": {"key": "k"}}));
        h.send(json!({"type": "workspace-get-context", "requestId": "sync"}));
        assert_eq!(h.next().await["requestId"], "sync");

        let store = h.store.clone();
        let slow_writer = std::thread::spawn(move || {
            store.set_data("k", json!("first"), None);
        });
        entered_rx.recv().unwrap();
        h.store.set_data("k", json!("second"), None);
        release_tx.send(()).unwrap();
        slow_writer.join().unwrap();

        let changed = h.next().await;
        assert_eq!(changed["dataState"]["version"], 2);
        assert_eq!(changed["dataState"]["value"], "second");
        h.silent().await;
    }

    #[tokio::test]
    async fn test_get_reports_cleared_key_as_missing() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));
        h.store.set_loading("k", true);
        h.send(json!({"type": "workspace-get-data", "payload": {"key": "k"}, "requestId": "r1"}));
        let reply = h.next().await;
        assert_eq!(reply["found"], true);
        assert_eq!(reply["data"]["loading"], true);

        h.store.clear_data("k");
        h.send(json!({"type": "workspace-get-data", "payload": {"key": "k"}, "requestId": "r2"}));
        let reply = h.next().await;
        assert_eq!(reply["found"], false);
        assert_eq!(reply["data"]["version"], 0);
    }

    #[tokio::test]
    async fn test_stream_forwarding_and_terminal_reply() {
        let mut frames = chunks(&["Hel"]);
        frames.push(Ok(AgentEvent::TextDelta {
            content: None,
            text: Some("lo".into()),
        }));
        frames.push(Ok(AgentEvent::Other));
        frames.push(Ok(AgentEvent::complete(None)));
        let mut h = Harness::start(dispatcher(ScriptedBackend {
            frames,
            ..ScriptedBackend::default()
        }));

        h.send(json!({
            "type": "workspace-execute-agent",
            "payload": {"agentName": "writer", "query": "hi", "requestId": "a1"},
            "requestId": "a1"
        }));

        let one = h.next().await;
        assert_eq!(one["type"], "workspace-execute-agent-response");
        assert_eq!(one["requestId"], "a1");
        assert_eq!(one["payload"], json!({"type": "chunk", "content": "Hel"}));
        let two = h.next().await;
        assert_eq!(two["payload"], json!({"type": "text_delta", "text": "lo"}));
        let done = h.next().await;
        assert_eq!(done["payload"], json!({"type": "complete", "fullResponse": "Hello"}));
        h.silent().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut frames = chunks(&["ok"]);
        frames.push(Err(AgentError::Parse("expected value".into())));
        frames.push(Ok(AgentEvent::complete(None)));
        let mut h = Harness::start(dispatcher(ScriptedBackend {
            frames,
            ..ScriptedBackend::default()
        }));

        h.send(json!({
            "type": "workspace-execute-agent",
            "payload": {"agentName": "writer", "query": "hi"},
            "requestId": "a2"
        }));
        assert_eq!(h.next().await["payload"]["content"], "ok");
        let done = h.next().await;
        assert_eq!(done["payload"]["type"], "complete");
        assert_eq!(done["payload"]["fullResponse"], "ok");
    }

    #[tokio::test]
    async fn test_agent_falls_back_to_context() {
        let backend = Arc::new(ScriptedBackend {
            frames: vec![Ok(AgentEvent::complete(Some("done".into())))],
            ..ScriptedBackend::default()
        });
        let context = ContextProvider::new(
            WorkspaceContext::new()
                .with_agent("a-7", "researcher")
                .with_session("s-1")
                .with_current_file("notes.md"),
        );
        let dispatcher = Dispatcher::new(
            Store::new(),
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            OriginPolicy::new([EMBED]),
        )
        .with_context(context);
        let mut h = Harness::start(dispatcher);

        h.send(json!({
            "type": "workspace-execute-agent",
            "payload": {"query": "what changed?"},
            "requestId": "a3"
        }));
        assert_eq!(h.next().await["payload"]["fullResponse"], "done");

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].agent_name, "researcher");
        assert_eq!(requests[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(requests[0].current_file.as_deref(), Some("notes.md"));
    }

    #[tokio::test]
    async fn test_missing_agent_short_circuits() {
        let backend = Arc::new(ScriptedBackend::default());
        let dispatcher = Dispatcher::new(
            Store::new(),
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            OriginPolicy::new([EMBED]),
        );
        let mut h = Harness::start(dispatcher);

        h.send(json!({
            "type": "workspace-execute-agent",
            "payload": {"query": "hello"},
            "requestId": "a4"
        }));
        let reply = h.next().await;
        assert_eq!(reply["payload"]["type"], "error");
        assert!(reply["payload"]["error"].as_str().unwrap().contains("No active agent"));
        assert!(backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_is_single_terminal_reply() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));
        h.send(json!({
            "type": "workspace-execute-agent",
            "payload": {"agentName": "missing", "query": "hello"},
            "requestId": "a5"
        }));
        let reply = h.next().await;
        assert_eq!(
            reply["payload"],
            json!({"type": "error", "error": "Agent not found: missing"})
        );
        h.silent().await;
    }

    #[tokio::test]
    async fn test_cancel_tears_down_backend_call() {
        let backend = Arc::new(ScriptedBackend {
            frames: chunks(&["partial"]),
            hang: true,
            ..ScriptedBackend::default()
        });
        let dispatcher = Dispatcher::new(
            Store::new(),
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            OriginPolicy::new([EMBED]),
        );
        let mut h = Harness::start(dispatcher);

        h.send(json!({
            "type": "workspace-execute-agent",
            "payload": {"agentName": "writer", "query": "long"},
            "requestId": "a6"
        }));
        assert_eq!(h.next().await["payload"]["content"], "partial");

        h.send(json!({"type": "workspace-cancel", "payload": {"requestId": "a6"}}));
        let reply = h.next().await;
        assert_eq!(reply["payload"]["type"], "error");
        assert_eq!(reply["payload"]["error"], "Agent execution cancelled");
        assert!(backend.cancels.lock().unwrap()[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_in_flight_work() {
        let backend = Arc::new(ScriptedBackend {
            frames: chunks(&["started"]),
            hang: true,
            ..ScriptedBackend::default()
        });
        let dispatcher = Dispatcher::new(
            Store::new(),
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            OriginPolicy::new([EMBED]),
        );
        let mut h = Harness::start(dispatcher);
        h.send(json!({"type": "workspace-subscribe", "payload": {"key": "k"}}));
        h.send(json!({
            "type": "workspace-execute-agent",
            "payload": {"agentName": "writer", "query": "long"},
            "requestId": "a7"
        }));
        assert_eq!(h.next().await["payload"]["content"], "started");
        assert_eq!(h.store.subscriber_count("k"), 1);

        let Harness { embed, store, task } = h;
        drop(embed);
        task.await.unwrap();

        assert_eq!(store.subscriber_count("k"), 0);
        let token = backend.cancels.lock().unwrap()[0].clone();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_file_and_navigate() {
        let (navigator, mut routes) = ChannelNavigator::new();
        let dispatcher = dispatcher(ScriptedBackend::default()).with_navigator(Arc::new(navigator));
        let mut h = Harness::start(dispatcher);

        h.send(json!({"type": "workspace-navigate", "payload": {"path": "/agents/writer"}}));
        h.send(json!({"type": "workspace-load-file", "payload": {"path": "a.md", "requestId": "f1"}}));
        let reply = h.next().await;
        assert_eq!(
            reply,
            json!({"type": "workspace-load-file-response", "requestId": "f1", "error": "File not found: a.md"})
        );
        assert_eq!(routes.recv().await.unwrap(), "/agents/writer");

        h.send(json!({"type": "workspace-load-file", "payload": {"path": "  "}, "requestId": "f2"}));
        let reply = h.next().await;
        assert!(reply["error"].as_str().unwrap().contains("path"));
    }

    #[tokio::test]
    async fn test_get_context_snapshot() {
        let dispatcher = dispatcher(ScriptedBackend::default());
        dispatcher
            .context()
            .replace(WorkspaceContext::new().with_user("u1", "Sam"));
        let mut h = Harness::start(dispatcher);

        h.send(json!({"type": "workspace-get-context", "requestId": "c1"}));
        let reply = h.next().await;
        assert_eq!(reply["type"], "workspace-get-context-response");
        assert_eq!(reply["context"]["userName"], "Sam");
        assert!(reply["context"]["currentFile"].is_null());
    }

    #[tokio::test]
    async fn test_untrusted_origin_is_ignored() {
        let dispatcher = Dispatcher::new(
            Store::new(),
            Arc::new(ScriptedBackend::default()),
            OriginPolicy::new(["https://someone-else.example"]),
        );
        let mut h = Harness::start(dispatcher);
        h.send(json!({
            "type": "workspace-set-data",
            "payload": {"key": "x", "value": 1},
            "requestId": "r"
        }));
        h.silent().await;
        assert!(!h.store.contains("x"));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_when_possible() {
        let mut h = Harness::start(dispatcher(ScriptedBackend::default()));
        h.send(json!({"type": "workspace-set-data", "payload": {"value": 1}, "requestId": "bad"}));
        let reply = h.next().await;
        assert_eq!(reply["type"], "workspace-set-data-response");
        assert_eq!(reply["success"], false);

        h.send(json!({"type": "workspace-reboot", "requestId": "x"}));
        h.send(json!("not even an object"));
        h.silent().await;
    }
}
