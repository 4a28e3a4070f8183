//! Client bridge: typed async calls over a port to the host.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use workspace_bus_core::{AgentEvent, DataState, WorkspaceContext};
use workspace_bus_transport::{
    ChannelError, PortReceiver, PortSender, Reply, Request, new_request_id,
};

use crate::{BridgeConfig, BridgeError};

type ChunkCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
type Listener = Arc<dyn Fn(&DataState) + Send + Sync>;

/// What the reader hands back to a waiting call.
#[derive(Debug)]
struct Settled {
    reply: Reply,
    /// Text of the intermediate agent replies seen before `reply`.
    accumulated: String,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Settled, BridgeError>>,
    on_chunk: Option<ChunkCallback>,
    accumulated: String,
}

type PendingRequests = HashMap<String, PendingRequest>;

/// Per-call options for agent execution.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Chat session to continue.
    pub session_id: Option<String>,
}

impl AgentOptions {
    #[must_use]
    pub fn with_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }
}

struct Inner {
    /// Taken on close; dropping it ends the host's side of the conversation.
    sender: StdMutex<Option<PortSender>>,
    config: BridgeConfig,
    pending: Mutex<PendingRequests>,
    listeners: StdMutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn listeners(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Listener)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post to the host, refusing untrusted targets.
    fn post(&self, request: &Request) -> Result<(), ChannelError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(ChannelError::Closed);
        };
        self.config.policy.check_target(sender.target_origin())?;
        sender.post(request)
    }

    async fn route(&self, data: Value) {
        let reply = match serde_json::from_value::<Reply>(data) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable reply from host");
                return;
            }
        };

        if let Reply::DataChanged { key, data_state } = &reply {
            self.notify(key, data_state);
            return;
        }
        let Some(request_id) = reply.request_id().map(str::to_owned) else {
            return;
        };

        if let Reply::ExecuteAgentResponse { payload, .. } = &reply {
            if !payload.is_terminal() {
                self.forward_chunk(&request_id, payload).await;
                return;
            }
        }

        let entry = self.pending.lock().await.remove(&request_id);
        match entry {
            Some(entry) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = entry.tx.send(Ok(Settled {
                    reply,
                    accumulated: entry.accumulated,
                }));
            }
            None => {
                tracing::debug!(%request_id, kind = reply.kind(), "Reply for settled or unknown request");
            }
        }
    }

    async fn forward_chunk(&self, request_id: &str, event: &AgentEvent) {
        let Some(delta) = event.delta() else {
            return;
        };
        let (callback, accumulated) = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get_mut(request_id) else {
                tracing::debug!(request_id, "Chunk for settled or unknown request");
                return;
            };
            entry.accumulated.push_str(delta);
            (entry.on_chunk.clone(), entry.accumulated.clone())
        };
        if let Some(callback) = callback {
            callback(delta, &accumulated);
        }
    }

    fn notify(&self, key: &str, state: &DataState) {
        let snapshot: Vec<Listener> = self
            .listeners()
            .get(key)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in snapshot {
            listener(state);
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.listeners().clear();
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::info!(pending = pending.len(), "Host channel closed, rejecting pending calls");
        }
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(BridgeError::Channel(ChannelError::Closed)));
        }
    }
}

/// Async RPC client for embedded content.
///
/// Cheap to clone; all clones share one channel and pending table. The
/// channel to the host is released by [`Bridge::close`] or when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// Start a bridge over a connected port.
    ///
    /// Spawns the reader task, so this must run inside a tokio runtime.
    #[must_use]
    pub fn new(sender: PortSender, mut receiver: PortReceiver, config: BridgeConfig) -> Self {
        let inner = Arc::new(Inner {
            sender: StdMutex::new(Some(sender)),
            config,
            pending: Mutex::new(PendingRequests::new()),
            listeners: StdMutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        // Weak, so dropping every Bridge clone drops the sender.
        let reader = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let Some(inner) = reader.upgrade() else {
                    break;
                };
                if !inner.config.policy.accepts(&frame) {
                    tracing::warn!(origin = %frame.origin, "Dropping frame from untrusted origin");
                    continue;
                }
                inner.route(frame.data).await;
            }
            if let Some(inner) = reader.upgrade() {
                inner.close().await;
            }
            tracing::debug!("Bridge reader stopped");
        });

        Self { inner }
    }

    /// Whether the host side has gone away or [`Bridge::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Hang up on the host.
    ///
    /// Pending calls fail with [`ChannelError::Closed`], local listeners are
    /// dropped, and the host tears down this connection's subscriptions and
    /// agent streams once it sees the channel end. Affects every clone.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Number of calls still waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Write `value` under `key`.
    ///
    /// # Errors
    /// Returns error if the host refuses the write or does not answer in time.
    pub async fn set_data(
        &self,
        key: &str,
        value: Value,
        source: Option<&str>,
    ) -> Result<(), BridgeError> {
        let id = new_request_id();
        let request = Request::set_data(&id, key, value, source, None);
        expect_write(self.data_call(id, request).await?)
    }

    /// Write `value` only if `key` is still at version `expected`.
    ///
    /// # Errors
    /// Returns [`BridgeError::Remote`] describing the conflict when another
    /// writer got there first.
    pub async fn set_data_if_version(
        &self,
        key: &str,
        value: Value,
        source: Option<&str>,
        expected: u64,
    ) -> Result<(), BridgeError> {
        let id = new_request_id();
        let request = Request::set_data(&id, key, value, source, Some(expected));
        expect_write(self.data_call(id, request).await?)
    }

    /// Read `key`; `None` when the host has never seen it.
    ///
    /// # Errors
    /// Returns error on timeout or channel failure.
    pub async fn get_data(&self, key: &str) -> Result<Option<DataState>, BridgeError> {
        let id = new_request_id();
        let request = Request::get_data(&id, key);
        match self.data_call(id, request).await?.reply {
            Reply::GetDataResponse { found, data, .. } => Ok(found.then_some(data)),
            other => Err(unexpected(&other)),
        }
    }

    /// Call `callback` with every change of `key` the host pushes.
    ///
    /// The host is asked to watch the key only for the first local listener.
    ///
    /// # Errors
    /// Returns error if the subscribe frame cannot be posted.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Result<ClientSubscription, BridgeError>
    where
        F: Fn(&DataState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut listeners = self.inner.listeners();
            let list = listeners.entry(key.to_owned()).or_default();
            list.push((id, Arc::new(callback)));
            list.len() == 1
        };

        if first {
            if let Err(e) = self.inner.post(&Request::subscribe(key)) {
                remove_listener(&self.inner, key, id);
                return Err(e.into());
            }
        }

        tracing::debug!(key, first, "Local listener added");
        Ok(ClientSubscription {
            key: key.to_owned(),
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Run an agent and return its final text.
    ///
    /// # Errors
    /// Returns the agent's error message as [`BridgeError::Remote`], or a
    /// timeout after the agent budget.
    pub async fn execute_agent(
        &self,
        agent_name: &str,
        query: &str,
        options: AgentOptions,
    ) -> Result<String, BridgeError> {
        self.agent_call(agent_name, query, None, options).await
    }

    /// Run an agent, calling `on_chunk(delta, accumulated)` for every piece of
    /// text as it arrives. Resolves with the final text.
    ///
    /// # Errors
    /// Same as [`Bridge::execute_agent`].
    pub async fn execute_agent_stream<F>(
        &self,
        agent_name: &str,
        query: &str,
        on_chunk: F,
        options: AgentOptions,
    ) -> Result<String, BridgeError>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.agent_call(agent_name, query, Some(Arc::new(on_chunk)), options)
            .await
    }

    /// Ask the host to show `path`. No reply is expected.
    ///
    /// # Errors
    /// Returns error if the frame cannot be posted.
    pub fn navigate(&self, path: &str) -> Result<(), BridgeError> {
        self.inner.post(&Request::navigate(path))?;
        Ok(())
    }

    /// Read a workspace file through the host.
    ///
    /// # Errors
    /// Returns the host's error message as [`BridgeError::Remote`].
    pub async fn load_file(&self, path: &str) -> Result<String, BridgeError> {
        let id = new_request_id();
        let request = Request::load_file(&id, path);
        match self.data_call(id, request).await?.reply {
            Reply::LoadFileResponse {
                content: Some(content),
                ..
            } => Ok(content),
            Reply::LoadFileResponse { error, .. } => Err(BridgeError::Remote(
                error.unwrap_or_else(|| format!("Failed to load {path}")),
            )),
            other => Err(unexpected(&other)),
        }
    }

    /// Snapshot of what the host has open.
    ///
    /// # Errors
    /// Returns error on timeout or channel failure.
    pub async fn get_context(&self) -> Result<WorkspaceContext, BridgeError> {
        let id = new_request_id();
        let request = Request::get_context(&id);
        match self.data_call(id, request).await?.reply {
            Reply::GetContextResponse { context, .. } => Ok(context),
            other => Err(unexpected(&other)),
        }
    }

    async fn agent_call(
        &self,
        agent_name: &str,
        query: &str,
        on_chunk: Option<ChunkCallback>,
        options: AgentOptions,
    ) -> Result<String, BridgeError> {
        let id = new_request_id();
        let request = Request::execute_agent(&id, agent_name, query, options.session_id.as_deref());
        let timeout = self.inner.config.agent_timeout;

        let settled = match self.call(id.clone(), &request, timeout, on_chunk).await {
            Err(e) if e.is_timeout() => {
                // Tear down the host-side stream instead of leaving it running unobserved.
                if let Err(post) = self.inner.post(&Request::cancel(&id)) {
                    tracing::debug!(request_id = %id, error = %post, "Could not post cancel");
                }
                return Err(e);
            }
            other => other?,
        };

        match settled.reply {
            Reply::ExecuteAgentResponse {
                payload: AgentEvent::Complete { full_response },
                ..
            } => Ok(full_response.unwrap_or(settled.accumulated)),
            Reply::ExecuteAgentResponse { payload, .. } => Err(BridgeError::Remote(
                payload
                    .error_message()
                    .unwrap_or("Agent execution failed")
                    .to_owned(),
            )),
            other => Err(unexpected(&other)),
        }
    }

    async fn data_call(&self, id: String, request: Request) -> Result<Settled, BridgeError> {
        self.call(id, &request, self.inner.config.data_timeout, None)
            .await
    }

    /// Register, post, then wait for exactly one of reply, close or timeout.
    async fn call(
        &self,
        id: String,
        request: &Request,
        timeout: Duration,
        on_chunk: Option<ChunkCallback>,
    ) -> Result<Settled, BridgeError> {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            // Checked under the lock: close drains the table after setting it.
            if self.is_closed() {
                return Err(ChannelError::Closed.into());
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    tx,
                    on_chunk,
                    accumulated: String::new(),
                },
            );
        }

        if let Err(e) = self.inner.post(request) {
            self.inner.pending.lock().await.remove(&id);
            return Err(e.into());
        }
        tracing::debug!(request_id = %id, kind = request.kind(), "Request posted");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.map_err(|_| BridgeError::Channel(ChannelError::Closed))?,
            Err(_) => {
                if self.inner.pending.lock().await.remove(&id).is_some() {
                    tracing::warn!(request_id = %id, kind = request.kind(), ?timeout, "Request timed out");
                    return Err(BridgeError::Timeout {
                        operation: request.kind(),
                        after: timeout,
                    });
                }
                // The reader settled it while we were timing out.
                rx.await
                    .map_err(|_| BridgeError::Channel(ChannelError::Closed))?
            }
        }
    }
}

/// Handle returned by [`Bridge::subscribe`].
pub struct ClientSubscription {
    key: String,
    id: u64,
    inner: Weak<Inner>,
}

impl ClientSubscription {
    /// Key this subscription watches.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop local notifications; the host stops pushing once the last local
    /// listener of the key is gone. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if remove_listener(&inner, &self.key, self.id) == Some(0) {
            if let Err(e) = inner.post(&Request::unsubscribe(&self.key)) {
                tracing::debug!(key = %self.key, error = %e, "Could not post unsubscribe");
            }
        }
    }
}

impl std::fmt::Debug for ClientSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSubscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Remove one listener; returns how many remain, or `None` if it was not there.
fn remove_listener(inner: &Inner, key: &str, id: u64) -> Option<usize> {
    let mut listeners = inner.listeners();
    let list = listeners.get_mut(key)?;
    let before = list.len();
    list.retain(|(lid, _)| *lid != id);
    if list.len() == before {
        return None;
    }
    let remaining = list.len();
    if remaining == 0 {
        listeners.remove(key);
    }
    Some(remaining)
}

fn expect_write(settled: Settled) -> Result<(), BridgeError> {
    match settled.reply {
        Reply::SetDataResponse { success: true, .. } => Ok(()),
        Reply::SetDataResponse { error, .. } => Err(BridgeError::Remote(
            error.unwrap_or_else(|| "Failed to set data".to_owned()),
        )),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(reply: &Reply) -> BridgeError {
    BridgeError::Decode(format!("{} does not answer this call", reply.kind()))
}
