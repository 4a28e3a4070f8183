//! Wire protocol between embedded content and the host.
//!
//! Requests are `{type, payload, requestId?}`; replies are
//! `{type, requestId, ...}` with reply-specific fields at the top level.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use workspace_bus_core::{AgentEvent, DataState, WorkspaceContext};

/// Envelope `type` strings.
pub mod types {
    pub const SET_DATA: &str = "workspace-set-data";
    pub const GET_DATA: &str = "workspace-get-data";
    pub const SUBSCRIBE: &str = "workspace-subscribe";
    pub const UNSUBSCRIBE: &str = "workspace-unsubscribe";
    pub const EXECUTE_AGENT: &str = "workspace-execute-agent";
    pub const CANCEL: &str = "workspace-cancel";
    pub const LOAD_FILE: &str = "workspace-load-file";
    pub const NAVIGATE: &str = "workspace-navigate";
    pub const GET_CONTEXT: &str = "workspace-get-context";

    pub const SET_DATA_RESPONSE: &str = "workspace-set-data-response";
    pub const GET_DATA_RESPONSE: &str = "workspace-get-data-response";
    pub const DATA_CHANGED: &str = "workspace-data-changed";
    pub const EXECUTE_AGENT_RESPONSE: &str = "workspace-execute-agent-response";
    pub const LOAD_FILE_RESPONSE: &str = "workspace-load-file-response";
    pub const GET_CONTEXT_RESPONSE: &str = "workspace-get-context-response";
}

/// Fresh correlation id.
#[must_use]
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Payload of `workspace-set-data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDataPayload {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Optimistic check; absent means last-write-wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

/// Payload carrying only a store key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPayload {
    pub key: String,
}

/// Payload of `workspace-execute-agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAgentPayload {
    /// Empty means "the agent in the current context".
    #[serde(default)]
    pub agent_name: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Payload carrying a path, for `load-file` and `navigate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPayload {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Payload carrying only a correlation id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Message from embedded content to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "workspace-set-data")]
    SetData {
        payload: SetDataPayload,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "workspace-get-data")]
    GetData {
        payload: KeyPayload,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "workspace-subscribe")]
    Subscribe { payload: KeyPayload },
    #[serde(rename = "workspace-unsubscribe")]
    Unsubscribe { payload: KeyPayload },
    #[serde(rename = "workspace-execute-agent")]
    ExecuteAgent {
        payload: ExecuteAgentPayload,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Stop an agent execution; the id to cancel is in the payload.
    #[serde(rename = "workspace-cancel")]
    Cancel { payload: RequestIdPayload },
    #[serde(rename = "workspace-load-file")]
    LoadFile {
        payload: PathPayload,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "workspace-navigate")]
    Navigate { payload: PathPayload },
    #[serde(rename = "workspace-get-context")]
    GetContext {
        #[serde(default)]
        payload: RequestIdPayload,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl Request {
    /// Envelope `type` string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SetData { .. } => types::SET_DATA,
            Self::GetData { .. } => types::GET_DATA,
            Self::Subscribe { .. } => types::SUBSCRIBE,
            Self::Unsubscribe { .. } => types::UNSUBSCRIBE,
            Self::ExecuteAgent { .. } => types::EXECUTE_AGENT,
            Self::Cancel { .. } => types::CANCEL,
            Self::LoadFile { .. } => types::LOAD_FILE,
            Self::Navigate { .. } => types::NAVIGATE,
            Self::GetContext { .. } => types::GET_CONTEXT,
        }
    }

    /// Correlation id, from the envelope or, failing that, the payload.
    ///
    /// `workspace-cancel` has none of its own; its payload names the target.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        let (top, inner) = match self {
            Self::SetData { request_id, .. } | Self::GetData { request_id, .. } => {
                (request_id.as_deref(), None)
            }
            Self::ExecuteAgent {
                request_id,
                payload,
            } => (request_id.as_deref(), payload.request_id.as_deref()),
            Self::LoadFile {
                request_id,
                payload,
            } => (request_id.as_deref(), payload.request_id.as_deref()),
            Self::GetContext {
                request_id,
                payload,
            } => (request_id.as_deref(), payload.request_id.as_deref()),
            Self::Subscribe { .. }
            | Self::Unsubscribe { .. }
            | Self::Cancel { .. }
            | Self::Navigate { .. } => (None, None),
        };
        top.or(inner).filter(|id| !id.is_empty())
    }

    /// `workspace-set-data`.
    #[must_use]
    pub fn set_data(
        request_id: &str,
        key: &str,
        value: Value,
        source: Option<&str>,
        expected_version: Option<u64>,
    ) -> Self {
        Self::SetData {
            payload: SetDataPayload {
                key: key.to_owned(),
                value,
                source: source.map(str::to_owned),
                expected_version,
            },
            request_id: Some(request_id.to_owned()),
        }
    }

    /// `workspace-get-data`.
    #[must_use]
    pub fn get_data(request_id: &str, key: &str) -> Self {
        Self::GetData {
            payload: KeyPayload { key: key.to_owned() },
            request_id: Some(request_id.to_owned()),
        }
    }

    /// `workspace-subscribe`.
    #[must_use]
    pub fn subscribe(key: &str) -> Self {
        Self::Subscribe {
            payload: KeyPayload { key: key.to_owned() },
        }
    }

    /// `workspace-unsubscribe`.
    #[must_use]
    pub fn unsubscribe(key: &str) -> Self {
        Self::Unsubscribe {
            payload: KeyPayload { key: key.to_owned() },
        }
    }

    /// `workspace-execute-agent`. The id is carried in both places.
    #[must_use]
    pub fn execute_agent(
        request_id: &str,
        agent_name: &str,
        query: &str,
        session_id: Option<&str>,
    ) -> Self {
        Self::ExecuteAgent {
            payload: ExecuteAgentPayload {
                agent_name: agent_name.to_owned(),
                query: query.to_owned(),
                session_id: session_id.map(str::to_owned),
                request_id: Some(request_id.to_owned()),
            },
            request_id: Some(request_id.to_owned()),
        }
    }

    /// `workspace-cancel`.
    #[must_use]
    pub fn cancel(request_id: &str) -> Self {
        Self::Cancel {
            payload: RequestIdPayload {
                request_id: Some(request_id.to_owned()),
            },
        }
    }

    /// `workspace-load-file`.
    #[must_use]
    pub fn load_file(request_id: &str, path: &str) -> Self {
        Self::LoadFile {
            payload: PathPayload {
                path: path.to_owned(),
                request_id: Some(request_id.to_owned()),
            },
            request_id: Some(request_id.to_owned()),
        }
    }

    /// `workspace-navigate`.
    #[must_use]
    pub fn navigate(path: &str) -> Self {
        Self::Navigate {
            payload: PathPayload {
                path: path.to_owned(),
                request_id: None,
            },
        }
    }

    /// `workspace-get-context`.
    #[must_use]
    pub fn get_context(request_id: &str) -> Self {
        Self::GetContext {
            payload: RequestIdPayload {
                request_id: Some(request_id.to_owned()),
            },
            request_id: Some(request_id.to_owned()),
        }
    }
}

/// Message from the host to embedded content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    #[serde(rename = "workspace-set-data-response")]
    SetDataResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "workspace-get-data-response")]
    GetDataResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        found: bool,
        data: DataState,
    },
    /// Pushed for every mutation of a subscribed key.
    #[serde(rename = "workspace-data-changed")]
    DataChanged {
        key: String,
        #[serde(rename = "dataState")]
        data_state: DataState,
    },
    /// Intermediate and terminal frames of one agent execution.
    #[serde(rename = "workspace-execute-agent-response")]
    ExecuteAgentResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: AgentEvent,
    },
    #[serde(rename = "workspace-load-file-response")]
    LoadFileResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "workspace-get-context-response")]
    GetContextResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        context: WorkspaceContext,
    },
}

impl Reply {
    /// Correlation id; `None` for pushed notifications.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::SetDataResponse { request_id, .. }
            | Self::GetDataResponse { request_id, .. }
            | Self::ExecuteAgentResponse { request_id, .. }
            | Self::LoadFileResponse { request_id, .. }
            | Self::GetContextResponse { request_id, .. } => Some(request_id),
            Self::DataChanged { .. } => None,
        }
    }

    /// Envelope `type` string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SetDataResponse { .. } => types::SET_DATA_RESPONSE,
            Self::GetDataResponse { .. } => types::GET_DATA_RESPONSE,
            Self::DataChanged { .. } => types::DATA_CHANGED,
            Self::ExecuteAgentResponse { .. } => types::EXECUTE_AGENT_RESPONSE,
            Self::LoadFileResponse { .. } => types::LOAD_FILE_RESPONSE,
            Self::GetContextResponse { .. } => types::GET_CONTEXT_RESPONSE,
        }
    }

    /// Whether this reply ends the call it answers.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::ExecuteAgentResponse { payload, .. } => payload.is_terminal(),
            Self::DataChanged { .. } => false,
            _ => true,
        }
    }

    /// Error reply for a request of type `request_type`, when that reply
    /// shape can carry an error at all.
    #[must_use]
    pub fn failure(request_type: &str, request_id: &str, message: impl Into<String>) -> Option<Self> {
        let request_id = request_id.to_owned();
        match request_type {
            types::SET_DATA => Some(Self::SetDataResponse {
                request_id,
                success: false,
                error: Some(message.into()),
            }),
            types::EXECUTE_AGENT => Some(Self::ExecuteAgentResponse {
                request_id,
                payload: AgentEvent::error(message),
            }),
            types::LOAD_FILE => Some(Self::LoadFileResponse {
                request_id,
                content: None,
                error: Some(message.into()),
            }),
            _ => None,
        }
    }
}
