//! Per-connection request handling.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use workspace_bus_core::{AgentRequest, BusError, Subscription};
use workspace_bus_transport::{
    ChannelError, OriginPolicy, PortSender, Reply, Request,
    protocol::{ExecuteAgentPayload, PathPayload, SetDataPayload, types},
};

use crate::{
    dispatcher::Dispatcher,
    stream::{AgentCall, run_agent},
};

/// Posts replies, but only to a trusted target.
#[derive(Clone)]
pub struct Replier {
    sender: PortSender,
    policy: Arc<OriginPolicy>,
}

impl Replier {
    pub const fn new(sender: PortSender, policy: Arc<OriginPolicy>) -> Self {
        Self { sender, policy }
    }

    /// Post `reply` to the connected peer.
    ///
    /// # Errors
    /// Returns error if the peer's origin is not trusted or it has gone away.
    pub fn send(&self, reply: &Reply) -> Result<(), ChannelError> {
        self.policy.check_target(self.sender.target_origin())?;
        self.sender.post(reply)
    }
}

struct InFlight {
    seq: u64,
    cancel: CancellationToken,
}

/// Agent executions started by one connection, by `requestId`.
#[derive(Clone, Default)]
struct InFlightTable {
    inner: Arc<Mutex<(u64, HashMap<String, InFlight>)>>,
}

impl InFlightTable {
    fn lock(&self) -> MutexGuard<'_, (u64, HashMap<String, InFlight>)> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new execution. A previous one under the same id is cancelled.
    fn register(&self, request_id: &str) -> (u64, CancellationToken) {
        let cancel = CancellationToken::new();
        let mut guard = self.lock();
        guard.0 += 1;
        let seq = guard.0;
        let previous = guard.1.insert(
            request_id.to_owned(),
            InFlight {
                seq,
                cancel: cancel.clone(),
            },
        );
        drop(guard);
        if let Some(previous) = previous {
            tracing::warn!(request_id, "Duplicate requestId, cancelling earlier execution");
            previous.cancel.cancel();
        }
        (seq, cancel)
    }

    fn finish(&self, request_id: &str, seq: u64) {
        let mut guard = self.lock();
        if guard.1.get(request_id).is_some_and(|f| f.seq == seq) {
            guard.1.remove(request_id);
        }
    }

    fn cancel(&self, request_id: &str) -> bool {
        let entry = self.lock().1.remove(request_id);
        entry.is_some_and(|f| {
            f.cancel.cancel();
            true
        })
    }

    fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().1.drain().map(|(_, f)| f).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }
}

/// State of one served connection.
pub struct Connection<'a> {
    dispatcher: &'a Dispatcher,
    replier: Replier,
    subscriptions: HashMap<String, Subscription>,
    in_flight: InFlightTable,
}

impl<'a> Connection<'a> {
    pub fn new(dispatcher: &'a Dispatcher, sender: PortSender) -> Self {
        Self {
            dispatcher,
            replier: Replier::new(sender, Arc::clone(&dispatcher.policy)),
            subscriptions: HashMap::new(),
            in_flight: InFlightTable::default(),
        }
    }

    /// Handle one already origin-checked frame body.
    pub fn handle(&mut self, data: Value) {
        let request = match serde_json::from_value::<Request>(data.clone()) {
            Ok(request) => request,
            Err(e) => {
                self.reject_malformed(&data, &e.to_string());
                return;
            }
        };

        let kind = request.kind();
        let request_id = request.request_id().map(str::to_owned);
        tracing::debug!(kind, request_id = ?request_id, "Handling request");

        match request {
            Request::SetData { payload, .. } => self.set_data(request_id, payload),
            Request::GetData { payload, .. } => {
                let Some(request_id) = require_id(request_id, kind) else {
                    return;
                };
                let data = self.dispatcher.store.get_data(&payload.key);
                let found = !data.is_empty();
                self.reply(&Reply::GetDataResponse {
                    request_id,
                    found,
                    data,
                });
            }
            Request::Subscribe { payload } => self.subscribe(payload.key),
            Request::Unsubscribe { payload } => {
                if let Some(subscription) = self.subscriptions.remove(&payload.key) {
                    subscription.unsubscribe();
                    tracing::debug!(key = %payload.key, "Unsubscribed");
                }
            }
            Request::ExecuteAgent { payload, .. } => self.execute_agent(request_id, payload),
            Request::Cancel { payload } => {
                let target = payload.request_id.unwrap_or_default();
                if self.in_flight.cancel(&target) {
                    tracing::info!(request_id = %target, "Cancel requested");
                } else {
                    tracing::debug!(request_id = %target, "Cancel for unknown or finished request");
                }
            }
            Request::LoadFile { payload, .. } => self.load_file(request_id, payload),
            Request::Navigate { payload } => {
                let path = payload.path.trim();
                if path.is_empty() {
                    tracing::warn!("Ignoring navigate with empty path");
                } else {
                    self.dispatcher.navigator.navigate(path);
                }
            }
            Request::GetContext { .. } => {
                let Some(request_id) = require_id(request_id, kind) else {
                    return;
                };
                self.reply(&Reply::GetContextResponse {
                    request_id,
                    context: self.dispatcher.context.snapshot(),
                });
            }
        }
    }

    /// Release everything this connection holds.
    pub fn shutdown(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            subscription.unsubscribe();
        }
        let cancelled = self.in_flight.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled in-flight agent executions on disconnect");
        }
    }

    fn set_data(&self, request_id: Option<String>, payload: SetDataPayload) {
        let store = &self.dispatcher.store;
        let SetDataPayload {
            key,
            value,
            source,
            expected_version,
        } = payload;

        let result = match expected_version {
            Some(expected) => store
                .set_data_if_version(&key, value, source.as_deref(), expected)
                .map_err(BusError::from),
            None => Ok(store.set_data(&key, value, source.as_deref())),
        };

        let error = match result {
            Ok(state) => {
                tracing::debug!(%key, version = state.version, "Data set");
                None
            }
            Err(e) => {
                tracing::info!(%key, error = %e, "Rejected write");
                Some(e.to_string())
            }
        };

        // Writes without an id are applied but cannot be answered.
        if let Some(request_id) = request_id {
            self.reply(&Reply::SetDataResponse {
                request_id,
                success: error.is_none(),
                error,
            });
        }
    }

    fn subscribe(&mut self, key: String) {
        if self.subscriptions.contains_key(&key) {
            tracing::debug!(%key, "Already subscribed");
            return;
        }
        let replier = self.replier.clone();
        let notify_key = key.clone();
        // Highest version forwarded; concurrent writers may notify out of order.
        let forwarded = Mutex::new(0_u64);
        let subscription = self.dispatcher.store.subscribe(&key, move |state| {
            let mut last = forwarded.lock().unwrap_or_else(PoisonError::into_inner);
            if state.version <= *last {
                tracing::debug!(key = %notify_key, version = state.version, "Skipped stale notification");
                return;
            }
            let reply = Reply::DataChanged {
                key: notify_key.clone(),
                data_state: state.clone(),
            };
            match replier.send(&reply) {
                Ok(()) => *last = state.version,
                Err(e) => {
                    tracing::debug!(key = %notify_key, error = %e, "Dropped change notification");
                }
            }
        });
        tracing::debug!(%key, "Subscribed");
        self.subscriptions.insert(key, subscription);
    }

    fn execute_agent(&self, request_id: Option<String>, payload: ExecuteAgentPayload) {
        let Some(request_id) = require_id(request_id, types::EXECUTE_AGENT) else {
            return;
        };
        let request = match self.agent_request(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::info!(%request_id, error = %e, "Agent call rejected");
                self.fail(types::EXECUTE_AGENT, &request_id, &e);
                return;
            }
        };

        let (seq, cancel) = self.in_flight.register(&request_id);
        let call = AgentCall {
            request_id: request_id.clone(),
            request,
            backend: Arc::clone(&self.dispatcher.backend),
            replier: self.replier.clone(),
            cancel,
        };
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            run_agent(call).await;
            in_flight.finish(&request_id, seq);
        });
    }

    /// Resolve the target agent and session, falling back to the context.
    fn agent_request(&self, payload: ExecuteAgentPayload) -> Result<AgentRequest, BusError> {
        let context = self.dispatcher.context.snapshot();
        let agent_name = Some(payload.agent_name)
            .filter(|name| !name.trim().is_empty())
            .or(context.agent_name)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| {
                BusError::precondition(
                    "No active agent: pass agentName or open an agent in the workspace",
                )
            })?;
        if payload.query.trim().is_empty() {
            return Err(BusError::precondition("Query must not be empty"));
        }

        Ok(AgentRequest {
            agent_name,
            query: payload.query,
            session_id: payload.session_id.or(context.session_id),
            current_file: context.current_file,
        })
    }

    fn load_file(&self, request_id: Option<String>, payload: PathPayload) {
        let Some(request_id) = require_id(request_id, types::LOAD_FILE) else {
            return;
        };
        let path = payload.path.trim().to_owned();
        if path.is_empty() {
            self.fail(
                types::LOAD_FILE,
                &request_id,
                &BusError::precondition("File path must not be empty"),
            );
            return;
        }

        let files = Arc::clone(&self.dispatcher.files);
        let replier = self.replier.clone();
        tokio::spawn(async move {
            let reply = match files.load(&path).await {
                Ok(content) => Reply::LoadFileResponse {
                    request_id,
                    content: Some(content),
                    error: None,
                },
                Err(e) => {
                    let e = BusError::from(e);
                    tracing::info!(%path, error = %e, "File load failed");
                    Reply::LoadFileResponse {
                        request_id,
                        content: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            if let Err(e) = replier.send(&reply) {
                tracing::debug!(error = %e, "Dropped file reply");
            }
        });
    }

    /// Answer a frame that did not decode, when its shape allows it.
    fn reject_malformed(&self, data: &Value, error: &str) {
        let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();
        let request_id = data
            .get("requestId")
            .or_else(|| data.pointer("/payload/requestId"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty());

        tracing::warn!(kind, request_id = ?request_id, error, "Malformed request");
        if let Some(reply) =
            request_id.and_then(|id| Reply::failure(kind, id, format!("Invalid request: {error}")))
        {
            self.reply(&reply);
        }
    }

    fn fail(&self, kind: &str, request_id: &str, error: &BusError) {
        if let Some(reply) = Reply::failure(kind, request_id, error.to_string()) {
            self.reply(&reply);
        }
    }

    fn reply(&self, reply: &Reply) {
        if let Err(e) = self.replier.send(reply) {
            tracing::debug!(kind = reply.kind(), error = %e, "Reply not delivered");
        }
    }
}

fn require_id(request_id: Option<String>, kind: &str) -> Option<String> {
    if request_id.is_none() {
        tracing::warn!(kind, "Request without requestId dropped");
    }
    request_id
}
