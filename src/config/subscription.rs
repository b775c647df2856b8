use serde::Deserialize;
use serde::Serialize;

use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubscriptionConfig {
    /// Open change watchers and sync sessions as live feeds when the request
    /// options do not say otherwise
    #[serde(default = "default_live")]
    pub default_live: bool,

    /// Log events that arrive for a feed with no matching handler
    #[serde(default)]
    pub log_unrouted_events: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            default_live: default_live(),
            log_unrouted_events: false,
        }
    }
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

fn default_live() -> bool {
    true
}
