//! Bridge configuration.

use std::time::Duration;

use workspace_bus_core::{
    BusConfig,
    config::{DEFAULT_AGENT_TIMEOUT_MS, DEFAULT_DATA_TIMEOUT_MS},
};
use workspace_bus_transport::OriginPolicy;

/// Timeouts and trust settings of one [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Budget for store, context and file calls.
    pub data_timeout: Duration,
    /// Budget for agent executions, streaming or not.
    pub agent_timeout: Duration,
    /// Origins whose frames are accepted and to which calls are posted.
    pub policy: OriginPolicy,
}

impl BridgeConfig {
    /// Default timeouts, trusting only `policy`.
    #[must_use]
    pub const fn new(policy: OriginPolicy) -> Self {
        Self {
            data_timeout: Duration::from_millis(DEFAULT_DATA_TIMEOUT_MS),
            agent_timeout: Duration::from_millis(DEFAULT_AGENT_TIMEOUT_MS),
            policy,
        }
    }

    /// Derive from the shared bus configuration.
    #[must_use]
    pub fn from_bus(config: &BusConfig) -> Self {
        Self {
            data_timeout: config.data_timeout(),
            agent_timeout: config.agent_timeout(),
            policy: OriginPolicy::from_config(config),
        }
    }

    #[must_use]
    pub const fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_bus(&BusConfig::default())
    }
}
