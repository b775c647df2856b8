//! Effect dispatcher and session-state manager for a replicating document
//! store.
//!
//! A host with an event-driven architecture describes side effects as data
//! ([`Request`]); the [`EffectDispatcher`] performs them against a
//! [`engine::DatabaseEngine`] and reports results either to callbacks or as
//! redispatched host events. Open handles, change watchers and sync sessions
//! are kept per database name in a [`HandleRegistry`].

pub mod codec;
mod config;
mod dispatcher;
pub mod engine;
mod errors;
pub mod receiver;
mod registry;
mod subscription;

pub use config::*;
pub use dispatcher::*;
pub use engine::memory::MemoryEngine;
pub use errors::*;
pub use receiver::EventBus;
pub use receiver::EventTag;
pub use receiver::HostEvent;
pub use receiver::Receiver;
pub use registry::*;
pub use subscription::*;

/// Tracing target for request routing and result delivery
pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
