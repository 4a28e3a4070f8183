//! Configuration shared by the host and the client bridge.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of every environment variable read by [`BusConfig::from_env`].
pub const ENV_PREFIX: &str = "WORKSPACE_BUS_";

/// Default reply window for store, context and file calls.
pub const DEFAULT_DATA_TIMEOUT_MS: u64 = 30_000;

/// Default reply window for agent execution.
pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 60_000;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// Bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Origins allowed to talk to us, and to be talked to.
    pub allowed_origins: Vec<String>,
    /// Origin the host stamps on frames it sends.
    pub host_origin: String,
    /// Reply window for store, context and file calls.
    pub data_timeout_ms: u64,
    /// Reply window for agent execution.
    pub agent_timeout_ms: u64,
    /// Base URL agents live under; `{base}/{agent}/workspace-execute`.
    pub agent_base_url: String,
    /// Directory `load-file` requests are served from.
    pub files_root: PathBuf,
    /// Address the host server binds.
    pub listen_addr: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            host_origin: "http://localhost:3000".to_string(),
            data_timeout_ms: DEFAULT_DATA_TIMEOUT_MS,
            agent_timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            agent_base_url: "http://127.0.0.1:8080/api/agents".to_string(),
            files_root: PathBuf::from("."),
            listen_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

impl BusConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON for this shape.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by `WORKSPACE_BUS_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    ///
    /// `lookup` receives the full variable name, e.g.
    /// `WORKSPACE_BUS_AGENT_BASE_URL`.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(origins) = get("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(origin) = get("HOST_ORIGIN") {
            config.host_origin = origin;
        }
        if let Some(ms) = get("DATA_TIMEOUT_MS") {
            config.data_timeout_ms = parse_ms("DATA_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = get("AGENT_TIMEOUT_MS") {
            config.agent_timeout_ms = parse_ms("AGENT_TIMEOUT_MS", &ms)?;
        }
        if let Some(url) = get("AGENT_BASE_URL") {
            config.agent_base_url = url.trim_end_matches('/').to_owned();
        }
        if let Some(root) = get("FILES_ROOT") {
            config.files_root = PathBuf::from(root);
        }
        if let Some(addr) = get("LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        Ok(config)
    }

    /// Reply window for store, context and file calls.
    #[must_use]
    pub const fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    /// Reply window for agent execution.
    #[must_use]
    pub const fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }
}

fn parse_ms(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            var: format!("{ENV_PREFIX}{name}"),
            value: value.to_owned(),
        })
}
