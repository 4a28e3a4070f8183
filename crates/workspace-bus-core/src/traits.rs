//! Collaborator traits the host dispatcher delegates to.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::AgentEvent;

/// What the dispatcher asks an agent backend to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Target agent.
    pub agent_name: String,
    /// Natural-language query.
    pub query: String,
    /// Chat session to continue, if any.
    pub session_id: Option<String>,
    /// File open in the workspace when the call was made.
    pub current_file: Option<String>,
}

/// Agent backend error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent request failed: {0}")]
    Http(String),
    #[error("Agent backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Agent not found: {0}")]
    NotFound(String),
    #[error("Agent stream failed: {0}")]
    Stream(String),
    #[error("Malformed agent frame: {0}")]
    Parse(String),
    #[error("Agent execution cancelled")]
    Cancelled,
}

impl AgentError {
    /// Parse errors are per-frame and never end a stream.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}

/// Stream of decoded agent frames.
///
/// Items carrying [`AgentError::Parse`] stand for a dropped frame; any other
/// error ends the stream.
pub type AgentEventStream = BoxStream<'static, Result<AgentEvent, AgentError>>;

/// Trait for agent execution backends.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Start an execution and return its event stream.
    ///
    /// Implementations must stop producing events and release network
    /// resources once `cancel` fires.
    async fn execute(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentEventStream, AgentError>;
}

/// File loading error.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Trait for reading workspace files on behalf of embedded content.
#[async_trait]
pub trait FileLoader: Send + Sync {
    /// Read the file at `path` as UTF-8 text.
    async fn load(&self, path: &str) -> Result<String, FileError>;
}

/// Host routing hook. Navigation is fire-and-forget.
pub trait Navigator: Send + Sync {
    /// Ask the host to show `path`.
    fn navigate(&self, path: &str);
}

/// Navigator that forwards paths to whoever owns the routing UI.
#[derive(Debug, Clone)]
pub struct ChannelNavigator {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelNavigator {
    /// Create a navigator and the receiver the router should drain.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Navigator for ChannelNavigator {
    fn navigate(&self, path: &str) {
        if self.tx.send(path.to_owned()).is_err() {
            tracing::debug!(path, "Navigation dropped, router is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_navigator_forwards_paths() {
        let (nav, mut rx) = ChannelNavigator::new();
        nav.navigate("/agents/writer");
        nav.navigate("/files/readme.md");
        assert_eq!(rx.try_recv().unwrap(), "/agents/writer");
        assert_eq!(rx.try_recv().unwrap(), "/files/readme.md");
    }

    #[test]
    fn test_navigator_survives_closed_router() {
        let (nav, rx) = ChannelNavigator::new();
        drop(rx);
        nav.navigate("/nowhere");
    }

    #[test]
    fn test_only_parse_errors_are_recoverable() {
        assert!(AgentError::Parse("bad json".into()).is_recoverable());
        assert!(!AgentError::Cancelled.is_recoverable());
        assert!(
            !AgentError::Status {
                status: 500,
                body: "boom".into()
            }
            .is_recoverable()
        );
    }
}
