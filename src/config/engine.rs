use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryEngineConfig {
    /// Capacity of each store's change broadcast. Live feeds that fall
    /// further behind receive an `error` event.
    #[serde(default = "default_change_buffer_size")]
    pub change_buffer_size: usize,

    /// Capacity of the channel between a feed task and its consumer
    #[serde(default = "default_feed_buffer_size")]
    pub feed_buffer_size: usize,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            change_buffer_size: default_change_buffer_size(),
            feed_buffer_size: default_feed_buffer_size(),
        }
    }
}

impl MemoryEngineConfig {
    /// # Errors
    /// Returns `Error::InvalidConfig` when a buffer size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.change_buffer_size == 0 {
            return Err(Error::InvalidConfig("engine.change_buffer_size must be greater than 0".into()));
        }
        if self.feed_buffer_size == 0 {
            return Err(Error::InvalidConfig("engine.feed_buffer_size must be greater than 0".into()));
        }
        Ok(())
    }
}

fn default_change_buffer_size() -> usize {
    1024
}

fn default_feed_buffer_size() -> usize {
    256
}
