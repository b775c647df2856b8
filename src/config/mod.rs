//! Configuration for the dispatcher, its subscriptions and the memory engine.
//!
//! Sources are merged in order, later ones overriding earlier ones:
//! 1. Defaults from code
//! 2. Configuration file named by `CONFIG_PATH` (if set)
//! 3. Environment variables with the `DOCFX__` prefix
mod dispatch;
mod engine;
mod subscription;

pub use dispatch::*;
pub use engine::*;
pub use subscription::*;


use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "DOCFX";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Request routing and result delivery
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Change watchers and sync sessions
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    /// Reference memory engine
    #[serde(default)]
    pub engine: MemoryEngineConfig,
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}

impl Settings {
    /// Loads defaults, then `CONFIG_PATH`, then environment variables.
    ///
    /// Does not validate; call [`Settings::validate`] once all overrides are
    /// applied.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        let settings: Self = builder.add_source(environment()).build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Layers another file over the current values; environment variables
    /// still win.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(self) -> Result<Self> {
        self.dispatch.validate()?;
        self.subscription.validate()?;
        self.engine.validate()?;
        Ok(self)
    }
}
