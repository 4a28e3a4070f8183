//! Snapshot of what the host currently has open.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Ambient workspace context exposed read-only to embedded content.
///
/// Replaced wholesale by whoever observes navigation and session changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceContext {
    /// Path of the file currently open, if any.
    pub current_file: Option<String>,
    /// Identifier of the active agent.
    pub agent_id: Option<String>,
    /// Name of the active agent, used as the default execution target.
    pub agent_name: Option<String>,
    /// Active chat session.
    pub session_id: Option<String>,
    /// Signed-in user.
    pub user_id: Option<String>,
    /// Display name of the signed-in user.
    pub user_name: Option<String>,
}

impl WorkspaceContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the open file.
    #[must_use]
    pub fn with_current_file(mut self, path: impl Into<String>) -> Self {
        self.current_file = Some(path.into());
        self
    }

    /// Set the active agent.
    #[must_use]
    pub fn with_agent(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self.agent_name = Some(name.into());
        self
    }

    /// Set the active session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the signed-in user.
    #[must_use]
    pub fn with_user(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self.user_name = Some(name.into());
        self
    }
}

/// Holds the latest [`WorkspaceContext`] and hands out snapshots.
#[derive(Debug, Clone, Default)]
pub struct ContextProvider {
    current: Arc<RwLock<WorkspaceContext>>,
}

impl ContextProvider {
    /// Create a provider seeded with `context`.
    #[must_use]
    pub fn new(context: WorkspaceContext) -> Self {
        Self {
            current: Arc::new(RwLock::new(context)),
        }
    }

    /// Swap in a new context.
    pub fn replace(&self, context: WorkspaceContext) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = context;
    }

    /// Copy of the context as it is right now.
    #[must_use]
    pub fn snapshot(&self) -> WorkspaceContext {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached() {
        let provider = ContextProvider::default();
        provider.replace(WorkspaceContext::new().with_current_file("notes.md"));

        let before = provider.snapshot();
        provider.replace(
            WorkspaceContext::new()
                .with_agent("a-1", "writer")
                .with_session("s-9"),
        );

        assert_eq!(before.current_file.as_deref(), Some("notes.md"));
        let after = provider.snapshot();
        assert_eq!(after.current_file, None);
        assert_eq!(after.agent_name.as_deref(), Some("writer"));
        assert_eq!(after.session_id.as_deref(), Some("s-9"));
    }

    #[test]
    fn test_wire_field_names() {
        let ctx = WorkspaceContext::new()
            .with_current_file("a.txt")
            .with_user("u1", "Sam");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["currentFile"], "a.txt");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["userName"], "Sam");
        assert!(json["agentName"].is_null());
    }
}
