//! Client side of the workspace bus.
//!
//! Embedded content holds a `Bridge` and calls the host through it:
//! store reads and writes, subscriptions, agent execution (streaming or not),
//! file loading, navigation and the context snapshot.

pub mod bridge;
pub mod config;
pub mod error;

pub use bridge::{AgentOptions, Bridge, ClientSubscription};
pub use config::BridgeConfig;
pub use error::BridgeError;
