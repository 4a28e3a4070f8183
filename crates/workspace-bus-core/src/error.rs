//! Host-side error taxonomy.

use thiserror::Error;

use crate::{
    store::StoreError,
    traits::{AgentError, FileError},
};

/// Errors the host reports back across the channel.
///
/// Every variant renders to the human-readable message sent to the caller.
#[derive(Debug, Error)]
pub enum BusError {
    /// No live peer to reply to.
    #[error("Channel error: {0}")]
    Channel(String),
    /// The agent backend failed or returned a non-success status.
    #[error("{0}")]
    Backend(String),
    /// A frame could not be decoded. Logged, never sent.
    #[error("Parse error: {0}")]
    Parse(String),
    /// File or agent target does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The call needs state that is not configured yet.
    #[error("{0}")]
    Precondition(String),
    /// An optimistic write lost the race.
    #[error(transparent)]
    Conflict(#[from] StoreError),
}

impl BusError {
    /// Shorthand for a precondition failure.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}

impl From<AgentError> for BusError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Parse(msg) => Self::Parse(msg),
            AgentError::NotFound(_) => Self::NotFound(err.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<FileError> for BusError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound(_) => Self::NotFound(err.to_string()),
            FileError::InvalidPath(_) => Self::Precondition(err.to_string()),
            FileError::Io { .. } => Self::Backend(err.to_string()),
        }
    }
}
