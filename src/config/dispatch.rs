use serde::Deserialize;
use serde::Serialize;

use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Log a warning when an operation fails and the request gave no failure
    /// receiver. The failure is absorbed either way.
    #[serde(default = "default_log_unhandled_failures")]
    pub log_unhandled_failures: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            log_unhandled_failures: default_log_unhandled_failures(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

fn default_log_unhandled_failures() -> bool {
    true
}
