//! In-process reference engine.
//!
//! Every database opened through one [`MemoryEngine`] lives in a shared map of
//! document stores, so names that look like remote URLs are just more local
//! stores. Replication between two handles copies revisions between their
//! stores directly.
//!
//! `open` hands out a fresh [`MemoryDatabase`] handle on every call, over the
//! same underlying store: like a real engine it cannot say whether the
//! database was already open.

mod database;
mod replicator;
mod selector;


pub use database::MemoryDatabase;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use nanoid::nanoid;
use parking_lot::RwLock;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::trace;

use super::Attachment;
use super::DatabaseEngine;
use super::DbHandle;
use crate::EngineError;
use crate::MemoryEngineConfig;

const REV_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

pub(crate) type StoreMap = DashMap<String, Arc<DocStore>>;

/// Engine whose databases live in process memory
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    stores: Arc<StoreMap>,
    config: MemoryEngineConfig,
}

impl MemoryEngine {
    pub fn new(config: MemoryEngineConfig) -> Self {
        Self {
            stores: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Number of stores that currently exist (destroyed ones excluded)
    pub fn store_count(&self) -> usize {
        self.stores.len()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(MemoryEngineConfig::default())
    }
}

impl DatabaseEngine for MemoryEngine {
    fn open(
        &self,
        name: &str,
    ) -> Result<DbHandle, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::bad_request("database name must not be empty"));
        }

        let store = self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(db = name, "creating memory store");
                Arc::new(DocStore::new(name, self.config.change_buffer_size))
            })
            .clone();

        Ok(Arc::new(MemoryDatabase::new(
            store,
            self.stores.clone(),
            self.config.feed_buffer_size,
        )))
    }
}

/// One change as broadcast to live feeds
#[derive(Debug, Clone)]
pub(crate) struct ChangeRecord {
    pub seq: u64,
    pub id: String,
    pub rev: String,
    pub deleted: bool,
    pub doc: Value,
}

impl ChangeRecord {
    pub(crate) fn to_event_payload(
        &self,
        include_docs: bool,
    ) -> Value {
        let mut payload = Map::new();
        payload.insert("id".to_string(), Value::from(self.id.clone()));
        payload.insert("seq".to_string(), Value::from(self.seq));
        payload.insert(
            "changes".to_string(),
            Value::Array(vec![single("rev", Value::from(self.rev.clone()))]),
        );
        if self.deleted {
            payload.insert("deleted".to_string(), Value::Bool(true));
        }
        if include_docs {
            payload.insert("doc".to_string(), self.doc.clone());
        }
        Value::Object(payload)
    }
}

/// Stored revision of one document
#[derive(Debug, Clone)]
pub(crate) struct DocRecord {
    pub rev: String,
    pub body: Map<String, Value>,
    pub attachments: BTreeMap<String, Attachment>,
    pub deleted: bool,
    pub seq: u64,
    /// Earlier revisions, oldest first; cleared by compaction
    pub history: Vec<String>,
}

impl DocRecord {
    /// Renders the document the way `get` returns it.
    pub(crate) fn render(
        &self,
        id: &str,
        with_attachment_data: bool,
    ) -> Value {
        let mut doc = self.body.clone();
        doc.insert("_id".to_string(), Value::from(id));
        doc.insert("_rev".to_string(), Value::from(self.rev.clone()));
        if self.deleted {
            doc.insert("_deleted".to_string(), Value::Bool(true));
        }
        if !self.attachments.is_empty() {
            let mut stubs = Map::new();
            for (name, attachment) in &self.attachments {
                let mut stub = Map::new();
                stub.insert("content_type".to_string(), Value::from(attachment.content_type.clone()));
                stub.insert("length".to_string(), Value::from(attachment.data.len()));
                if with_attachment_data {
                    stub.insert("data".to_string(), Value::from(attachment.data.clone()));
                } else {
                    stub.insert("stub".to_string(), Value::Bool(true));
                }
                stubs.insert(name.clone(), Value::Object(stub));
            }
            doc.insert("_attachments".to_string(), Value::Object(stubs));
        }
        Value::Object(doc)
    }

    fn knows(
        &self,
        rev: &str,
    ) -> bool {
        self.rev == rev || self.history.iter().any(|r| r == rev)
    }
}

/// A document write with `new_edits` semantics
#[derive(Debug)]
pub(crate) struct DocWrite {
    pub id: String,
    pub expected_rev: Option<String>,
    pub body: Map<String, Value>,
    pub attachments: AttachmentsUpdate,
    pub deleted: bool,
}

/// What a write does to the document's attachments
#[derive(Debug)]
pub(crate) enum AttachmentsUpdate {
    Keep,
    Drop,
    Put(String, Attachment),
    Remove(String),
}

#[derive(Debug, Clone)]
pub(crate) struct IndexDef {
    pub ddoc: String,
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexDef {
    pub(crate) fn describe(&self) -> Value {
        let fields: Vec<Value> = self.fields.iter().map(|f| single(f, Value::from("asc"))).collect();
        let mut def = Map::new();
        def.insert("ddoc".to_string(), Value::from(self.ddoc.clone()));
        def.insert("name".to_string(), Value::from(self.name.clone()));
        def.insert("type".to_string(), Value::from("json"));
        def.insert("def".to_string(), single("fields", Value::Array(fields)));
        Value::Object(def)
    }
}

#[derive(Debug, Default)]
pub(crate) struct DbState {
    pub docs: BTreeMap<String, DocRecord>,
    pub update_seq: u64,
    pub indexes: BTreeMap<String, IndexDef>,
}

impl DbState {
    pub(crate) fn live_doc(
        &self,
        id: &str,
    ) -> Option<&DocRecord> {
        self.docs.get(id).filter(|d| !d.deleted)
    }

    pub(crate) fn doc_count(&self) -> usize {
        self.docs.values().filter(|d| !d.deleted).count()
    }

    /// Latest change of every document touched after `since`, in seq order
    pub(crate) fn changes_since(
        &self,
        since: u64,
    ) -> Vec<ChangeRecord> {
        let mut records: Vec<ChangeRecord> = self
            .docs
            .iter()
            .filter(|(_, d)| d.seq > since)
            .map(|(id, d)| ChangeRecord {
                seq: d.seq,
                id: id.clone(),
                rev: d.rev.clone(),
                deleted: d.deleted,
                doc: d.render(id, false),
            })
            .collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    /// Applies a local edit, checking the expected revision.
    pub(crate) fn write(
        &mut self,
        write: DocWrite,
    ) -> Result<ChangeRecord, EngineError> {
        let existing = self.docs.get(&write.id);
        let generation = match (existing, write.expected_rev.as_deref()) {
            (None, None) => 1,
            (Some(current), None) if current.deleted => rev_generation(&current.rev) + 1,
            (Some(current), Some(rev)) if current.rev == rev => rev_generation(&current.rev) + 1,
            _ => return Err(EngineError::conflict()),
        };

        let (mut attachments, mut history) = match existing {
            Some(current) => {
                let mut history = current.history.clone();
                history.push(current.rev.clone());
                (current.attachments.clone(), history)
            }
            None => (BTreeMap::new(), Vec::new()),
        };
        if existing.map(|d| d.deleted).unwrap_or(false) {
            attachments.clear();
        }

        match write.attachments {
            AttachmentsUpdate::Keep => {}
            AttachmentsUpdate::Drop => attachments.clear(),
            AttachmentsUpdate::Put(name, attachment) => {
                attachments.insert(name, attachment);
            }
            AttachmentsUpdate::Remove(name) => {
                if attachments.remove(&name).is_none() {
                    return Err(EngineError::not_found(format!("attachment {} is missing", name)));
                }
            }
        }
        if write.deleted {
            attachments.clear();
        }

        let rev = format!("{}-{}", generation, nanoid!(32, &REV_ALPHABET));
        self.update_seq += 1;
        let record = DocRecord {
            rev,
            body: write.body,
            attachments,
            deleted: write.deleted,
            seq: self.update_seq,
            history,
        };
        let change = ChangeRecord {
            seq: record.seq,
            id: write.id.clone(),
            rev: record.rev.clone(),
            deleted: record.deleted,
            doc: record.render(&write.id, false),
        };
        trace!(id = %write.id, rev = %record.rev, seq = record.seq, "document written");
        self.docs.insert(write.id, record);
        Ok(change)
    }

    /// Merges a revision produced elsewhere (`new_edits: false`).
    ///
    /// Returns `None` when the revision is already known or loses to the
    /// current winner.
    pub(crate) fn merge(
        &mut self,
        id: &str,
        mut incoming: DocRecord,
    ) -> Option<ChangeRecord> {
        if let Some(current) = self.docs.get_mut(id) {
            if current.knows(&incoming.rev) {
                return None;
            }
            if !rev_wins(&incoming.rev, &current.rev) {
                current.history.push(incoming.rev);
                return None;
            }
            let mut history = current.history.clone();
            history.push(current.rev.clone());
            for rev in incoming.history.drain(..) {
                if !history.contains(&rev) {
                    history.push(rev);
                }
            }
            incoming.history = history;
        }

        self.update_seq += 1;
        incoming.seq = self.update_seq;
        let change = ChangeRecord {
            seq: incoming.seq,
            id: id.to_string(),
            rev: incoming.rev.clone(),
            deleted: incoming.deleted,
            doc: incoming.render(id, false),
        };
        self.docs.insert(id.to_string(), incoming);
        Some(change)
    }
}

/// Shared state of one named database
#[derive(Debug)]
pub(crate) struct DocStore {
    pub name: String,
    pub state: RwLock<DbState>,
    pub changes: broadcast::Sender<ChangeRecord>,
    pub destroyed: AtomicBool,
}

impl DocStore {
    fn new(
        name: &str,
        change_buffer_size: usize,
    ) -> Self {
        let (changes, _) = broadcast::channel(change_buffer_size.max(1));
        Self {
            name: name.to_string(),
            state: RwLock::new(DbState::default()),
            changes,
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Broadcasts changes to live feeds. Having no listener is fine.
    pub(crate) fn publish(
        &self,
        changes: Vec<ChangeRecord>,
    ) {
        for change in changes {
            let _ = self.changes.send(change);
        }
    }
}

pub(crate) fn rev_generation(rev: &str) -> u64 {
    rev.split_once('-').and_then(|(n, _)| n.parse().ok()).unwrap_or(0)
}

/// Deterministic winner between two revisions: higher generation, then
/// higher hash.
pub(crate) fn rev_wins(
    candidate: &str,
    current: &str,
) -> bool {
    let c = (rev_generation(candidate), candidate.split_once('-').map(|(_, h)| h).unwrap_or(""));
    let o = (rev_generation(current), current.split_once('-').map(|(_, h)| h).unwrap_or(""));
    c > o
}

pub(crate) fn single(
    key: &str,
    value: Value,
) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}
