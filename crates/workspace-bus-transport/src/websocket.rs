//! WebSocket transport: exposes a [`PortHandler`] to browser contexts.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::ORIGIN},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    channel::{Frame, PortHandler, PortReceiver, PortSender},
    origin::OriginPolicy,
};

/// WebSocket handler state.
pub struct WsState<S> {
    /// Serves each upgraded connection.
    pub handler: Arc<S>,
    /// Origin stamped on frames we send.
    pub host_origin: String,
    /// Origins allowed to upgrade.
    pub policy: OriginPolicy,
}

impl<S> Clone for WsState<S> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            host_origin: self.host_origin.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<S> WsState<S> {
    /// Create new WebSocket state.
    #[must_use]
    pub fn new(handler: Arc<S>, host_origin: impl Into<String>, policy: OriginPolicy) -> Self {
        Self {
            handler,
            host_origin: host_origin.into(),
            policy,
        }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler. Upgrades from origins outside the
/// allow-list are refused with 403.
pub async fn ws_handler<S>(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<WsState<S>>,
) -> Response
where
    S: PortHandler,
{
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("null")
        .to_owned();

    if !state.policy.allows(&origin) {
        tracing::warn!(%origin, "Refusing WebSocket upgrade from untrusted origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, origin, state))
}

async fn handle_socket<S>(socket: WebSocket, origin: String, state: WsState<S>)
where
    S: PortHandler,
{
    let (mut sink, mut stream) = socket.split();

    // Frames posted by the handler, written to the socket
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    // Frames read from the socket, handed to the handler
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame.data) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let peer_origin = origin.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(s) => s,
                    Err(_) => continue,
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!("WebSocket error: {e}");
                    break;
                }
            };

            let data = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Invalid frame from {peer_origin}: {e}");
                    continue;
                }
            };

            if in_tx
                .send(Frame {
                    origin: peer_origin.clone(),
                    data,
                })
                .is_err()
            {
                break;
            }
        }
    });

    tracing::info!(%origin, "WebSocket connection opened");
    let sender = PortSender::new(state.host_origin.clone(), origin.clone(), out_tx);
    state.handler.serve(sender, PortReceiver::new(in_rx)).await;

    recv_task.abort();
    send_task.abort();
    tracing::info!(%origin, "WebSocket connection closed");
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(dispatcher, "http://localhost:3000", policy));
/// ```
#[must_use]
pub fn create_ws_router<S>(
    handler: Arc<S>,
    host_origin: impl Into<String>,
    policy: OriginPolicy,
) -> axum::Router
where
    S: PortHandler,
{
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<S>))
        .with_state(WsState::new(handler, host_origin, policy))
}
