//! Handle Registry
//!
//! Maps each database identifier to exactly one open engine handle plus the
//! long-lived subscriptions attached to it. Every read-check-create-store
//! sequence runs while holding the map entry, so concurrent first uses of
//! one identifier open the database once and observe the same handle.
//!
//! Closures passed to [`HandleRegistry::replace_subscription`] run under the
//! entry lock and must not call back into the registry.

#[cfg(test)]
mod registry_test;

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::engine::DatabaseEngine;
use crate::engine::DbHandle;
use crate::DispatchError;
use crate::Subscription;

/// Identifier of a database, as the host names it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbName(String);

impl DbName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DbName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DbName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DbName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for DbName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A database as a request refers to it: by name, or by an open handle
#[derive(Clone)]
pub enum DbRef {
    Name(DbName),
    Handle(DbHandle),
}

impl DbRef {
    /// Registry key; a handle is keyed by the name it was opened with.
    pub fn name(&self) -> DbName {
        match self {
            Self::Name(name) => name.clone(),
            Self::Handle(handle) => DbName::new(handle.name()),
        }
    }
}

impl From<&str> for DbRef {
    fn from(name: &str) -> Self {
        Self::Name(DbName::new(name))
    }
}

impl From<String> for DbRef {
    fn from(name: String) -> Self {
        Self::Name(DbName::from(name))
    }
}

impl From<DbName> for DbRef {
    fn from(name: DbName) -> Self {
        Self::Name(name)
    }
}

impl From<DbHandle> for DbRef {
    fn from(handle: DbHandle) -> Self {
        Self::Handle(handle)
    }
}

impl fmt::Debug for DbRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("DbRef::Name").field(name).finish(),
            Self::Handle(handle) => f.debug_tuple("DbRef::Handle").field(&handle.name()).finish(),
        }
    }
}

/// Long-lived subscription slots of a handle entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    ChangeWatcher,
    SyncSession,
}

impl SubscriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChangeWatcher => "change-watcher",
            Self::SyncSession => "sync-session",
        }
    }
}

struct HandleEntry {
    handle: DbHandle,
    change_watcher: Option<Subscription>,
    sync_session: Option<Subscription>,
}

impl HandleEntry {
    fn new(handle: DbHandle) -> Self {
        Self {
            handle,
            change_watcher: None,
            sync_session: None,
        }
    }

    fn slot_mut(
        &mut self,
        kind: SubscriptionKind,
    ) -> &mut Option<Subscription> {
        match kind {
            SubscriptionKind::ChangeWatcher => &mut self.change_watcher,
            SubscriptionKind::SyncSession => &mut self.sync_session,
        }
    }

    fn slot(
        &self,
        kind: SubscriptionKind,
    ) -> Option<&Subscription> {
        match kind {
            SubscriptionKind::ChangeWatcher => self.change_watcher.as_ref(),
            SubscriptionKind::SyncSession => self.sync_session.as_ref(),
        }
    }

    fn cancel_all(&mut self) {
        for kind in [SubscriptionKind::ChangeWatcher, SubscriptionKind::SyncSession] {
            if let Some(subscription) = self.slot_mut(kind).take() {
                subscription.cancel();
            }
        }
    }
}

/// Process-wide cache of open database handles
pub struct HandleRegistry {
    engine: Arc<dyn DatabaseEngine>,
    entries: DashMap<DbName, HandleEntry>,
}

impl HandleRegistry {
    pub fn new(engine: Arc<dyn DatabaseEngine>) -> Self {
        Self {
            engine,
            entries: DashMap::new(),
        }
    }

    /// Returns the handle for `db`, opening and caching it on first use.
    ///
    /// A [`DbRef::Handle`] is returned unchanged.
    pub fn resolve(
        &self,
        db: &DbRef,
    ) -> Result<DbHandle, DispatchError> {
        match db {
            DbRef::Handle(handle) => Ok(handle.clone()),
            DbRef::Name(name) => Ok(self.entry(db, name)?.handle.clone()),
        }
    }

    /// Swaps the `kind` subscription of `db` for the one `open` produces.
    ///
    /// The old subscription is cancelled before `open` runs. The entry is
    /// created (opening the database) if this is the first use of `db`.
    pub(crate) fn replace_subscription<F>(
        &self,
        db: &DbRef,
        kind: SubscriptionKind,
        open: F,
    ) -> Result<(), DispatchError>
    where
        F: FnOnce(&DbHandle) -> Result<Subscription, DispatchError>,
    {
        let name = db.name();
        let mut entry = self.entry(db, &name)?;

        if let Some(previous) = entry.slot_mut(kind).take() {
            debug!(db = %name, kind = kind.as_str(), id = previous.id(), "replacing subscription");
            previous.cancel();
        }

        let handle = entry.handle.clone();
        let subscription = open(&handle)?;
        debug!(db = %name, kind = kind.as_str(), id = subscription.id(), "subscription stored");
        *entry.slot_mut(kind) = Some(subscription);
        Ok(())
    }

    /// Cancels and forgets the `kind` subscription of `name`.
    ///
    /// Returns whether one existed; a missing entry or slot is not an error.
    pub fn cancel_subscription(
        &self,
        name: &DbName,
        kind: SubscriptionKind,
    ) -> bool {
        let Some(mut entry) = self.entries.get_mut(name) else {
            return false;
        };
        match entry.slot_mut(kind).take() {
            Some(subscription) => {
                debug!(db = %name, kind = kind.as_str(), id = subscription.id(), "subscription cancelled");
                subscription.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the entry of `name` if it still holds `handle`, cancelling its
    /// subscriptions.
    pub fn evict(
        &self,
        name: &DbName,
        handle: &DbHandle,
    ) -> bool {
        match self
            .entries
            .remove_if(name, |_, entry| Arc::ptr_eq(&entry.handle, handle))
        {
            Some((_, mut entry)) => {
                entry.cancel_all();
                debug!(db = %name, "handle evicted");
                true
            }
            None => false,
        }
    }

    /// Cancels every subscription and forgets every handle.
    pub fn clear(&self) {
        self.entries.retain(|_, entry| {
            entry.cancel_all();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.entries.contains_key(name)
    }

    pub fn has_subscription(
        &self,
        name: &str,
        kind: SubscriptionKind,
    ) -> bool {
        self.entries
            .get(name)
            .map(|entry| entry.slot(kind).is_some())
            .unwrap_or(false)
    }

    /// Locks the entry of `name`, creating it from `db` when absent.
    fn entry(
        &self,
        db: &DbRef,
        name: &DbName,
    ) -> Result<RefMut<'_, DbName, HandleEntry>, DispatchError> {
        match self.entries.entry(name.clone()) {
            Entry::Occupied(occupied) => Ok(occupied.into_ref()),
            Entry::Vacant(vacant) => {
                let handle = match db {
                    DbRef::Handle(handle) => handle.clone(),
                    DbRef::Name(name) => self
                        .engine
                        .open(name.as_str())
                        .map_err(|e| DispatchError::unresolved_db(name.as_str(), e))?,
                };
                debug!(db = %name, "database opened");
                Ok(vacant.insert(HandleEntry::new(handle)))
            }
        }
    }
}

impl Drop for HandleRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
