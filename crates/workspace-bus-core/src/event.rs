//! Agent stream events, shared by the backend and the wire protocol.

use serde::{Deserialize, Serialize};

/// One decoded frame of an agent execution stream.
///
/// `chunk` and `text_delta` are equivalent incremental-text variants; backends
/// put the text in either `content` or `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental text.
    Chunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Incremental text (alternate spelling used by some backends).
    TextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Successful end of stream.
    Complete {
        #[serde(
            rename = "fullResponse",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        full_response: Option<String>,
    },
    /// Failed end of stream.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Any frame type we do not act on (metadata, tool calls, ...).
    #[serde(other)]
    Other,
}

impl AgentEvent {
    /// Incremental text frame.
    #[must_use]
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            content: Some(content.into()),
            text: None,
        }
    }

    /// Terminal success frame.
    #[must_use]
    pub const fn complete(full_response: Option<String>) -> Self {
        Self::Complete { full_response }
    }

    /// Terminal failure frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: Some(message.into()),
        }
    }

    /// Text carried by an incremental frame.
    #[must_use]
    pub fn delta(&self) -> Option<&str> {
        match self {
            Self::Chunk { content, text } | Self::TextDelta { content, text } => {
                content.as_deref().or(text.as_deref())
            }
            _ => None,
        }
    }

    /// Whether this frame ends the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Human-readable message of an error frame.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { error } => Some(error.as_deref().unwrap_or("Agent execution failed")),
            _ => None,
        }
    }
}
