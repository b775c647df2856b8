//! Database engine capability.
//!
//! The dispatcher never performs I/O itself; it talks to the engine through
//! these traits. Every document operation resolves to a JSON success value or
//! an [`EngineError`]. Change feeds and replication sessions are exposed as a
//! [`Feed`]: a stream of named [`EngineEvent`]s plus the token that stops it.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::EngineError;

/// Free-form options object passed through to the engine
pub type Options = Map<String, Value>;

/// Outcome of one engine operation
pub type EngineResult = std::result::Result<Value, EngineError>;

/// An open database
pub type DbHandle = Arc<dyn Database>;

/// Event names emitted on feeds
pub const CHANGE_EVENT: &str = "change";
pub const COMPLETE_EVENT: &str = "complete";
pub const PAUSED_EVENT: &str = "paused";
pub const ACTIVE_EVENT: &str = "active";
pub const ERROR_EVENT: &str = "error";

/// Opens databases by name
#[cfg_attr(test, automock)]
pub trait DatabaseEngine: Send + Sync + 'static {
    /// Opens (or creates) the database called `name`.
    ///
    /// The engine cannot tell whether the database already existed; callers
    /// that need one handle per name must cache the result themselves.
    fn open(
        &self,
        name: &str,
    ) -> Result<DbHandle, EngineError>;
}

/// Binary attachment payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Operations of one open database
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Stable name the database was opened with
    fn name(&self) -> &str;

    // Documents
    async fn put(
        &self,
        doc: Value,
        options: &Options,
    ) -> EngineResult;

    async fn post(
        &self,
        doc: Value,
        options: &Options,
    ) -> EngineResult;

    async fn get(
        &self,
        doc_id: &str,
        options: &Options,
    ) -> EngineResult;

    async fn remove(
        &self,
        doc_id: &str,
        rev: &str,
        options: &Options,
    ) -> EngineResult;

    async fn destroy(
        &self,
        options: &Options,
    ) -> EngineResult;

    // Bulk
    async fn bulk_docs(
        &self,
        docs: Vec<Value>,
        options: &Options,
    ) -> EngineResult;

    async fn all_docs(
        &self,
        options: &Options,
    ) -> EngineResult;

    async fn bulk_get(
        &self,
        options: &Options,
    ) -> EngineResult;

    // Attachments
    async fn put_attachment(
        &self,
        doc_id: &str,
        attachment_id: &str,
        rev: Option<&str>,
        attachment: Attachment,
    ) -> EngineResult;

    async fn get_attachment(
        &self,
        doc_id: &str,
        attachment_id: &str,
        options: &Options,
    ) -> EngineResult;

    async fn remove_attachment(
        &self,
        doc_id: &str,
        attachment_id: &str,
        rev: &str,
    ) -> EngineResult;

    // Index and query
    async fn create_index(
        &self,
        index: Value,
    ) -> EngineResult;

    async fn find(
        &self,
        request: &Options,
    ) -> EngineResult;

    async fn explain(
        &self,
        request: &Options,
    ) -> EngineResult;

    async fn get_indexes(&self) -> EngineResult;

    async fn delete_index(
        &self,
        index: Value,
    ) -> EngineResult;

    async fn query(
        &self,
        fun: Value,
        options: &Options,
    ) -> EngineResult;

    async fn view_cleanup(&self) -> EngineResult;

    // Maintenance
    async fn info(&self) -> EngineResult;

    async fn compact(
        &self,
        options: &Options,
    ) -> EngineResult;

    async fn revs_diff(
        &self,
        diff: &Options,
    ) -> EngineResult;

    async fn close(&self) -> EngineResult;

    // Subscriptions
    /// Opens a change feed. Emits `change` events until cancelled, or until
    /// `complete` when the feed is not live.
    fn changes(
        &self,
        options: &Options,
    ) -> Result<Feed, EngineError>;

    /// Replicates this database into `target`.
    fn replicate(
        &self,
        target: DbHandle,
        options: &Options,
    ) -> Result<Feed, EngineError>;

    /// Replicates in both directions between this database and `target`.
    fn sync(
        &self,
        target: DbHandle,
        options: &Options,
    ) -> Result<Feed, EngineError>;
}

/// Named event emitted by a feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineEvent {
    pub name: String,
    pub payload: Value,
}

impl EngineEvent {
    pub fn new(
        name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// A long-lived stream of engine events.
///
/// The engine stops producing once `cancel` is triggered; dropping a feed
/// does not cancel it.
pub struct Feed {
    events: mpsc::Receiver<EngineEvent>,
    cancel: CancellationToken,
}

impl Feed {
    pub fn new(
        events: mpsc::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { events, cancel }
    }

    pub fn into_parts(self) -> (mpsc::Receiver<EngineEvent>, CancellationToken) {
        (self.events, self.cancel)
    }
}

impl fmt::Debug for Feed {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Feed")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
