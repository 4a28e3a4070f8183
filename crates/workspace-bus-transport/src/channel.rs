//! Message channel between two isolated contexts.
//!
//! A channel carries untyped JSON frames stamped with the sender's origin;
//! receivers decide what to trust and how to decode.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// One message as delivered to a receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Origin of the context that posted the frame, stamped by the transport.
    pub origin: String,
    /// Message body.
    pub data: Value,
}

/// Channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("No live target to post to")]
    Closed,
    #[error("Origin '{0}' is not allowed")]
    OriginRefused(String),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sending half of a port. Cheap to clone; posting never blocks.
#[derive(Debug, Clone)]
pub struct PortSender {
    origin: String,
    target_origin: String,
    tx: mpsc::UnboundedSender<Frame>,
}

impl PortSender {
    /// Wrap a raw frame sender.
    #[must_use]
    pub fn new(
        origin: impl Into<String>,
        target_origin: impl Into<String>,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            origin: origin.into(),
            target_origin: target_origin.into(),
            tx,
        }
    }

    /// Our own origin, stamped on every frame.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Origin of the context frames are delivered to.
    #[must_use]
    pub fn target_origin(&self) -> &str {
        &self.target_origin
    }

    /// Whether the receiving side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Serialize and post a message.
    ///
    /// # Errors
    /// Returns error if the message cannot be encoded or the peer is gone.
    pub fn post<T: Serialize>(&self, message: &T) -> Result<(), ChannelError> {
        let data = serde_json::to_value(message)?;
        self.tx
            .send(Frame {
                origin: self.origin.clone(),
                data,
            })
            .map_err(|_| ChannelError::Closed)
    }
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl PortReceiver {
    /// Wrap a raw frame receiver.
    #[must_use]
    pub const fn new(rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { rx }
    }

    /// Next frame, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// Both halves of one side of a channel.
#[derive(Debug)]
pub struct Port {
    pub sender: PortSender,
    pub receiver: PortReceiver,
}

/// Create a connected pair of ports: `(host side, embedded side)`.
#[must_use]
pub fn pair(host_origin: &str, embed_origin: &str) -> (Port, Port) {
    let (to_embed, from_host) = mpsc::unbounded_channel();
    let (to_host, from_embed) = mpsc::unbounded_channel();

    let host = Port {
        sender: PortSender::new(host_origin, embed_origin, to_embed),
        receiver: PortReceiver::new(from_embed),
    };
    let embed = Port {
        sender: PortSender::new(embed_origin, host_origin, to_host),
        receiver: PortReceiver::new(from_host),
    };
    (host, embed)
}

/// Something that serves one connected port until its receiver closes.
#[async_trait]
pub trait PortHandler: Send + Sync + 'static {
    /// Serve the connection.
    async fn serve(&self, sender: PortSender, receiver: PortReceiver);
}
