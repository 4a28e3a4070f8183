//! Bridge error type.

use std::time::Duration;

use thiserror::Error;
use workspace_bus_transport::ChannelError;

/// Why a bridge call was rejected.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No reply arrived within the call's budget.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// The channel to the host is gone or refused the post.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    /// The host answered with an error.
    #[error("{0}")]
    Remote(String),
    /// The host answered with something this call cannot use.
    #[error("Unexpected reply: {0}")]
    Decode(String),
}

impl BridgeError {
    /// True for timeouts, which the caller may want to retry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = BridgeError::Timeout {
            operation: "workspace-get-data",
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "workspace-get-data timed out after 30000ms");
        assert!(err.is_timeout());

        let err = BridgeError::from(ChannelError::Closed);
        assert_eq!(err.to_string(), "Channel error: No live target to post to");
        assert!(!err.is_timeout());

        assert_eq!(BridgeError::Remote("File not found: a.md".into()).to_string(), "File not found: a.md");
    }
}
