//! Transport layer for the workspace bus.
//!
//! Provides:
//! - Wire protocol (`Request`, `Reply`)
//! - In-process message channel with origin stamping
//! - Origin allow-list
//! - WebSocket transport (feature: websocket)

pub mod channel;
pub mod origin;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{ChannelError, Frame, Port, PortHandler, PortReceiver, PortSender, pair};
pub use origin::OriginPolicy;
pub use protocol::{Reply, Request, new_request_id};
