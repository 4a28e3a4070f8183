//! Origin allow-list checked on every inbound and outbound frame.

use std::collections::HashSet;

use workspace_bus_core::BusConfig;

use crate::channel::{ChannelError, Frame};

/// Explicit set of trusted origins.
///
/// Origins compare as `scheme://host[:port]`, case-insensitive, without a
/// trailing slash. There is no wildcard.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
}

impl OriginPolicy {
    /// Build a policy from a list of origins.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = origins
            .into_iter()
            .filter_map(|origin| {
                let origin = normalize(origin.as_ref());
                if origin == "*" {
                    tracing::warn!("Ignoring wildcard origin, list origins explicitly");
                    return None;
                }
                (!origin.is_empty()).then_some(origin)
            })
            .collect();
        Self { allowed }
    }

    /// Policy for the origins listed in `config`.
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(&config.allowed_origins)
    }

    /// Whether `origin` is trusted.
    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        self.allowed.contains(&normalize(origin))
    }

    /// Whether an inbound frame may be processed.
    #[must_use]
    pub fn accepts(&self, frame: &Frame) -> bool {
        self.allows(&frame.origin)
    }

    /// Refuse to post to an untrusted target.
    ///
    /// # Errors
    /// Returns [`ChannelError::OriginRefused`] for origins not on the list.
    pub fn check_target(&self, origin: &str) -> Result<(), ChannelError> {
        if self.allows(origin) {
            Ok(())
        } else {
            Err(ChannelError::OriginRefused(origin.to_owned()))
        }
    }

    /// Number of trusted origins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    /// True when nothing is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
