//! HTTP/SSE agent backend for the workspace bus.
//!
//! Provides:
//! - `HttpAgentBackend` - `AgentBackend` over `POST <agent>/workspace-execute`
//! - Incremental SSE decoding into `AgentEvent` frames

pub mod client;
pub mod sse;

pub use client::{HttpAgentBackend, event_stream};
pub use sse::{SseDecoder, decode_event, decode_events};
