//! Callback normalization for asynchronous results.
//!
//! A [`Receiver`] is either an opaque callback or a symbolic [`EventTag`] that
//! gets redispatched into the host's event system through an [`EventBus`]. Both
//! are resolved once, at wrap time, into the same [`Callback`] shape so the
//! rest of the crate never inspects which kind it was given.

#[cfg(test)]
mod receiver_test;

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::codec;
use crate::EngineError;
use crate::DISPATCH_TARGET;

/// Uniform invocation contract every receiver is resolved into
pub type Callback = Arc<dyn Fn(Value) + Send + Sync>;

/// Symbolic name of a host event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTag(String);

impl EventTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for EventTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl fmt::Display for EventTag {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event redispatched to the host: `[tag payload]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostEvent {
    pub tag: EventTag,
    pub payload: Value,
}

/// The host's event system.
///
/// Implementations must not block: they are called from tokio tasks.
pub trait EventBus: Send + Sync + 'static {
    fn dispatch(
        &self,
        event: HostEvent,
    );
}

/// Where an asynchronous result is delivered
#[derive(Clone)]
pub enum Receiver {
    /// Invoke this function with the converted result
    Callback(Callback),
    /// Redispatch the converted result as a host event with this tag
    Event(EventTag),
}

impl Receiver {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    pub fn event(tag: impl Into<EventTag>) -> Self {
        Self::Event(tag.into())
    }
}

impl From<EventTag> for Receiver {
    fn from(tag: EventTag) -> Self {
        Self::Event(tag)
    }
}

impl fmt::Debug for Receiver {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Receiver::Callback(..)"),
            Self::Event(tag) => f.debug_tuple("Receiver::Event").field(tag).finish(),
        }
    }
}

/// Resolves a receiver into a callback.
///
/// - tag: redispatches `[tag payload]` on `bus`
/// - callback: invokes it with the payload
/// - absent: does nothing
pub fn wrap(
    receiver: Option<&Receiver>,
    bus: &Arc<dyn EventBus>,
) -> Callback {
    match receiver {
        Some(Receiver::Event(tag)) => {
            let tag = tag.clone();
            let bus = bus.clone();
            Arc::new(move |payload| {
                bus.dispatch(HostEvent {
                    tag: tag.clone(),
                    payload,
                })
            })
        }
        Some(Receiver::Callback(callback)) => callback.clone(),
        None => Arc::new(|_| {}),
    }
}

/// Success and failure channels of one promise-returning operation.
///
/// `complete` consumes the value, so exactly one channel fires per outcome.
pub struct Completion {
    on_success: Callback,
    on_failure: Callback,
}

impl Completion {
    /// Wraps both receivers.
    ///
    /// When `failure` is absent and `warn_unhandled` is set, the failure is
    /// still absorbed but a warning naming `method` is logged.
    pub fn new(
        method: &'static str,
        success: Option<&Receiver>,
        failure: Option<&Receiver>,
        bus: &Arc<dyn EventBus>,
        warn_unhandled: bool,
    ) -> Self {
        let on_failure = match failure {
            None if warn_unhandled => Arc::new(move |payload: Value| {
                warn!(
                    target: DISPATCH_TARGET,
                    method,
                    %payload,
                    "operation failed and no failure receiver was given"
                );
            }) as Callback,
            other => wrap(other, bus),
        };

        Self {
            on_success: wrap(success, bus),
            on_failure,
        }
    }

    pub fn complete(
        self,
        result: Result<Value, EngineError>,
    ) {
        match result {
            Ok(value) => (self.on_success)(value),
            Err(error) => (self.on_failure)(codec::error_payload(&error)),
        }
    }
}
