//! Subscription Manager
//!
//! Owns the long-lived engine feeds of the system: at most one change
//! watcher and one sync session per database identifier, stored in the
//! [`HandleRegistry`] entry, plus uncached one-shot replications.
//!
//! Each feed is drained by a pump task that routes engine events by name to
//! the wrapped receivers. Cancelling a [`Subscription`] cancels the feed's
//! token and aborts the pump; the pump re-checks the token before every
//! delivery, so a replaced subscription never reaches its handlers again.


use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::engine::DbHandle;
use crate::engine::Feed;
use crate::engine::Options;
use crate::engine::CHANGE_EVENT;
use crate::receiver::wrap;
use crate::receiver::Callback;
use crate::receiver::EventBus;
use crate::receiver::Receiver;
use crate::DbRef;
use crate::DispatchError;
use crate::HandleRegistry;
use crate::SubscriptionConfig;
use crate::SubscriptionKind;
use crate::DISPATCH_TARGET;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receivers keyed by engine event name
pub type Handlers = HashMap<String, Receiver>;

/// A running engine feed and the task delivering its events.
///
/// Dropping a subscription leaves it running; only [`Subscription::cancel`]
/// stops it.
pub struct Subscription {
    id: u64,
    token: CancellationToken,
    pump: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops the feed and its pump. Takes effect before this call returns
    /// for every event not yet being delivered.
    pub fn cancel(&self) {
        self.token.cancel();
        self.pump.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the pump has stopped, either cancelled or because the feed
    /// ended.
    pub fn is_finished(&self) -> bool {
        self.pump.is_finished()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Drains `feed` on a new task, invoking the route registered for each event
/// name.
pub(crate) fn spawn_pump(
    feed: Feed,
    routes: HashMap<String, Callback>,
    log_unrouted: bool,
) -> Subscription {
    let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
    let (mut events, token) = feed.into_parts();
    let pump_token = token.clone();

    let pump = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = pump_token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if pump_token.is_cancelled() {
                trace!(target: DISPATCH_TARGET, id, event = %event.name, "dropping event of cancelled subscription");
                break;
            }
            match routes.get(&event.name) {
                Some(route) => route(event.payload),
                None if log_unrouted => {
                    debug!(target: DISPATCH_TARGET, id, event = %event.name, "no handler for event")
                }
                None => {}
            }
        }
        trace!(target: DISPATCH_TARGET, id, "subscription pump stopped");
    });

    Subscription { id, token, pump }
}

pub struct SubscriptionManager {
    registry: Arc<HandleRegistry>,
    bus: Arc<dyn EventBus>,
    config: SubscriptionConfig,
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<HandleRegistry>,
        bus: Arc<dyn EventBus>,
        config: SubscriptionConfig,
    ) -> Self {
        Self { registry, bus, config }
    }

    /// Starts watching `db` for changes, replacing any existing watcher.
    ///
    /// `handler` receives every `change` event payload.
    pub fn attach_change_watcher(
        &self,
        db: &DbRef,
        options: Options,
        handler: &Receiver,
    ) -> Result<(), DispatchError> {
        let options = self.with_default_live(options);
        let mut routes = HashMap::new();
        routes.insert(CHANGE_EVENT.to_string(), wrap(Some(handler), &self.bus));

        self.registry
            .replace_subscription(db, SubscriptionKind::ChangeWatcher, |handle| {
                let feed = handle
                    .changes(&options)
                    .map_err(|e| DispatchError::subscription("attach-change-watcher", handle.name(), e))?;
                Ok(spawn_pump(feed, routes, self.config.log_unrouted_events))
            })
    }

    /// Stops the change watcher of `db`; a no-op when there is none.
    pub fn cancel_watcher(
        &self,
        db: &DbRef,
    ) {
        self.registry
            .cancel_subscription(&db.name(), SubscriptionKind::ChangeWatcher);
    }

    /// Starts a bidirectional sync between `db` and `target`, replacing any
    /// existing session of `db`.
    pub fn start_sync(
        &self,
        db: &DbRef,
        target: &DbRef,
        options: Options,
        handlers: &Handlers,
    ) -> Result<(), DispatchError> {
        // Resolved before the entry of `db` is locked.
        let target = self.registry.resolve(target)?;
        let options = self.with_default_live(options);
        let routes = self.routes(handlers);

        self.registry
            .replace_subscription(db, SubscriptionKind::SyncSession, |handle| {
                let feed = handle
                    .sync(target, &options)
                    .map_err(|e| DispatchError::subscription("sync", handle.name(), e))?;
                Ok(spawn_pump(feed, routes, self.config.log_unrouted_events))
            })
    }

    /// Stops the sync session of `db`; a no-op when there is none.
    pub fn cancel_sync(
        &self,
        db: &DbRef,
    ) {
        self.registry
            .cancel_subscription(&db.name(), SubscriptionKind::SyncSession);
    }

    /// Starts a one-way replication. Pulls `target` into `db`, or pushes `db`
    /// into `target` when `outbound` is set.
    ///
    /// The replication is not cached; the caller owns the returned handle.
    pub fn replicate(
        &self,
        db: &DbRef,
        target: &DbRef,
        options: Options,
        handlers: &Handlers,
        outbound: bool,
    ) -> Result<Subscription, DispatchError> {
        let local = self.registry.resolve(db)?;
        let remote = self.registry.resolve(target)?;
        let (source, destination): (DbHandle, DbHandle) = if outbound { (local, remote) } else { (remote, local) };

        let feed = source
            .replicate(destination.clone(), &options)
            .map_err(|e| DispatchError::subscription("replicate", source.name(), e))?;
        debug!(
            target: DISPATCH_TARGET,
            from = source.name(),
            to = destination.name(),
            "replication started"
        );
        Ok(spawn_pump(feed, self.routes(handlers), self.config.log_unrouted_events))
    }

    fn routes(
        &self,
        handlers: &Handlers,
    ) -> HashMap<String, Callback> {
        handlers
            .iter()
            .map(|(event, receiver)| (event.clone(), wrap(Some(receiver), &self.bus)))
            .collect()
    }

    fn with_default_live(
        &self,
        mut options: Options,
    ) -> Options {
        if self.config.default_live && !options.contains_key("live") {
            options.insert("live".to_string(), Value::Bool(true));
        }
        options
    }
}
