use std::cmp::Ordering as Collation;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use nanoid::nanoid;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::replicator::ChangesTask;
use super::replicator::Leg;
use super::replicator::ReplicationTask;
use super::selector;
use super::AttachmentsUpdate;
use super::ChangeRecord;
use super::DbState;
use super::DocRecord;
use super::DocStore;
use super::DocWrite;
use super::IndexDef;
use super::StoreMap;
use crate::engine::Attachment;
use crate::engine::Database;
use crate::engine::DbHandle;
use crate::engine::EngineEvent;
use crate::engine::EngineResult;
use crate::engine::Feed;
use crate::engine::Options;
use crate::EngineError;

/// Handle over one memory store.
///
/// Several handles may share a store; closing one handle leaves the others
/// usable, destroying the store invalidates all of them.
pub struct MemoryDatabase {
    store: Arc<DocStore>,
    stores: Arc<StoreMap>,
    feed_buffer_size: usize,
    closed: AtomicBool,
}

/// A document split into its reserved fields and its body
struct ParsedDoc {
    id: Option<String>,
    rev: Option<String>,
    deleted: bool,
    has_attachments: bool,
    body: Map<String, Value>,
}

impl ParsedDoc {
    fn parse(doc: Value) -> Result<Self, EngineError> {
        let Value::Object(fields) = doc else {
            return Err(EngineError::bad_request("document must be a JSON object"));
        };

        let mut parsed = ParsedDoc {
            id: None,
            rev: None,
            deleted: false,
            has_attachments: false,
            body: Map::new(),
        };
        for (key, value) in fields {
            match key.as_str() {
                "_id" => parsed.id = value.as_str().map(str::to_string),
                "_rev" => parsed.rev = value.as_str().map(str::to_string),
                "_deleted" => parsed.deleted = value.as_bool().unwrap_or(false),
                "_attachments" => parsed.has_attachments = true,
                reserved if reserved.starts_with('_') => {}
                _ => {
                    parsed.body.insert(key, value);
                }
            }
        }
        Ok(parsed)
    }

    fn into_write(
        self,
        id: String,
    ) -> DocWrite {
        DocWrite {
            id,
            expected_rev: self.rev,
            body: self.body,
            attachments: if self.has_attachments {
                AttachmentsUpdate::Keep
            } else {
                AttachmentsUpdate::Drop
            },
            deleted: self.deleted,
        }
    }

    /// Turns a replicated document into a record that keeps its revision.
    fn into_record(self) -> Result<(String, DocRecord), EngineError> {
        let id = self.id.ok_or_else(missing_id)?;
        let rev = self
            .rev
            .ok_or_else(|| EngineError::bad_request("_rev is required when new_edits is false"))?;
        let record = DocRecord {
            rev,
            body: self.body,
            attachments: BTreeMap::new(),
            deleted: self.deleted,
            seq: 0,
            history: Vec::new(),
        };
        Ok((id, record))
    }
}

fn missing_id() -> EngineError {
    EngineError::new(412, "missing_id", "_id is required for puts")
}

fn write_result(change: &ChangeRecord) -> Value {
    json!({ "ok": true, "id": change.id, "rev": change.rev })
}

fn error_row(
    id: Option<&str>,
    error: &EngineError,
) -> Value {
    json!({
        "id": id,
        "error": error.error,
        "reason": error.reason,
        "status": error.status,
    })
}

impl MemoryDatabase {
    pub(crate) fn new(
        store: Arc<DocStore>,
        stores: Arc<StoreMap>,
        feed_buffer_size: usize,
    ) -> Self {
        Self {
            store,
            stores,
            feed_buffer_size: feed_buffer_size.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.store.is_destroyed()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::closed(&self.store.name));
        }
        Ok(())
    }

    /// Runs one mutation under the store's write lock, then broadcasts it.
    fn commit<F>(
        &self,
        mutate: F,
    ) -> Result<ChangeRecord, EngineError>
    where
        F: FnOnce(&mut DbState) -> Result<ChangeRecord, EngineError>,
    {
        self.ensure_open()?;
        let change = {
            let mut state = self.store.state.write();
            mutate(&mut state)?
        };
        self.store.publish(vec![change.clone()]);
        Ok(change)
    }

    fn merge_docs(
        &self,
        docs: Vec<Value>,
    ) -> Result<(), EngineError> {
        let records = docs
            .into_iter()
            .map(|doc| ParsedDoc::parse(doc)?.into_record())
            .collect::<Result<Vec<_>, _>>()?;

        let changes: Vec<ChangeRecord> = {
            let mut state = self.store.state.write();
            records
                .into_iter()
                .filter_map(|(id, record)| state.merge(&id, record))
                .collect()
        };
        self.store.publish(changes);
        Ok(())
    }

    fn target_store(
        &self,
        target: &DbHandle,
    ) -> Result<Arc<DocStore>, EngineError> {
        self.stores
            .get(target.name())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::not_found(format!("database {} does not exist", target.name())))
    }

    fn spawn_feed<F, Fut>(
        &self,
        run: F,
    ) -> Feed
    where
        F: FnOnce(mpsc::Sender<EngineEvent>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(self.feed_buffer_size);
        let token = CancellationToken::new();
        tokio::spawn(run(events_tx, token.clone()));
        Feed::new(events_rx, token)
    }

    fn live_option(options: &Options) -> bool {
        selector::bool_option(options, "live", false) || selector::bool_option(options, "continuous", false)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.store.name
    }

    async fn put(
        &self,
        doc: Value,
        options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        if !selector::bool_option(options, "new_edits", true) {
            self.merge_docs(vec![doc])?;
            return Ok(json!({ "ok": true }));
        }

        let parsed = ParsedDoc::parse(doc)?;
        let id = parsed.id.clone().ok_or_else(missing_id)?;
        let change = self.commit(|state| state.write(parsed.into_write(id)))?;
        Ok(write_result(&change))
    }

    async fn post(
        &self,
        doc: Value,
        _options: &Options,
    ) -> EngineResult {
        let parsed = ParsedDoc::parse(doc)?;
        let id = parsed.id.clone().unwrap_or_else(|| nanoid!());
        let change = self.commit(|state| state.write(parsed.into_write(id)))?;
        Ok(write_result(&change))
    }

    async fn get(
        &self,
        doc_id: &str,
        options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let state = self.store.state.read();
        let record = match state.docs.get(doc_id) {
            None => return Err(EngineError::not_found("missing")),
            Some(record) => record,
        };

        match options.get("rev").and_then(Value::as_str) {
            Some(rev) if rev != record.rev => Err(EngineError::not_found("missing")),
            Some(_) => Ok(record.render(doc_id, selector::bool_option(options, "attachments", false))),
            None if record.deleted => Err(EngineError::not_found("deleted")),
            None => Ok(record.render(doc_id, selector::bool_option(options, "attachments", false))),
        }
    }

    async fn remove(
        &self,
        doc_id: &str,
        rev: &str,
        _options: &Options,
    ) -> EngineResult {
        let change = self.commit(|state| {
            if state.live_doc(doc_id).is_none() {
                return Err(EngineError::not_found("missing"));
            }
            state.write(DocWrite {
                id: doc_id.to_string(),
                expected_rev: Some(rev.to_string()),
                body: Map::new(),
                attachments: AttachmentsUpdate::Drop,
                deleted: true,
            })
        })?;
        Ok(write_result(&change))
    }

    async fn destroy(
        &self,
        _options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        self.store.destroyed.store(true, Ordering::SeqCst);
        self.stores
            .remove_if(&self.store.name, |_, store| Arc::ptr_eq(store, &self.store));
        *self.store.state.write() = DbState::default();
        self.closed.store(true, Ordering::SeqCst);
        debug!(db = %self.store.name, "memory store destroyed");
        Ok(json!({ "ok": true }))
    }

    async fn bulk_docs(
        &self,
        docs: Vec<Value>,
        options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        if !selector::bool_option(options, "new_edits", true) {
            self.merge_docs(docs)?;
            return Ok(Value::Array(Vec::new()));
        }

        let mut results = Vec::with_capacity(docs.len());
        let mut changes = Vec::new();
        {
            let mut state = self.store.state.write();
            for doc in docs {
                let parsed = match ParsedDoc::parse(doc) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        results.push(error_row(None, &error));
                        continue;
                    }
                };
                let id = parsed.id.clone().unwrap_or_else(|| nanoid!());
                match state.write(parsed.into_write(id.clone())) {
                    Ok(change) => {
                        results.push(write_result(&change));
                        changes.push(change);
                    }
                    Err(error) => results.push(error_row(Some(&id), &error)),
                }
            }
        }
        self.store.publish(changes);
        Ok(Value::Array(results))
    }

    async fn all_docs(
        &self,
        options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let include_docs = selector::bool_option(options, "include_docs", false);
        let descending = selector::bool_option(options, "descending", false);
        let inclusive_end = selector::bool_option(options, "inclusive_end", true);
        let skip = selector::usize_option(options, "skip")?;
        let limit = selector::usize_option(options, "limit")?;
        let start = options
            .get("startkey")
            .or_else(|| options.get("start_key"))
            .and_then(Value::as_str);
        let end = options.get("endkey").or_else(|| options.get("end_key")).and_then(Value::as_str);

        let state = self.store.state.read();
        let row = |id: &str, record: &DocRecord| {
            let mut row = json!({ "id": id, "key": id, "value": { "rev": record.rev } });
            if record.deleted {
                row["value"]["deleted"] = Value::Bool(true);
                if include_docs {
                    row["doc"] = Value::Null;
                }
            } else if include_docs {
                row["doc"] = record.render(id, false);
            }
            row
        };

        let rows: Vec<Value> = match options.get("keys") {
            Some(Value::Array(keys)) => keys
                .iter()
                .map(|key| match key.as_str().and_then(|id| state.docs.get(id).map(|r| (id, r))) {
                    Some((id, record)) => row(id, record),
                    None => json!({ "key": key, "error": "not_found" }),
                })
                .collect(),
            Some(_) => return Err(EngineError::bad_request("keys must be an array")),
            None => {
                let in_range = |id: &str| {
                    let (low, high) = if descending { (end, start) } else { (start, end) };
                    let above = low.map_or(true, |low| {
                        if descending && !inclusive_end {
                            id > low
                        } else {
                            id >= low
                        }
                    });
                    let below = high.map_or(true, |high| {
                        if !descending && !inclusive_end {
                            id < high
                        } else {
                            id <= high
                        }
                    });
                    above && below
                };
                let live = state
                    .docs
                    .iter()
                    .filter(|(id, record)| !record.deleted && in_range(id.as_str()))
                    .map(|(id, record)| row(id.as_str(), record));
                if descending {
                    live.rev().collect()
                } else {
                    live.collect()
                }
            }
        };

        Ok(json!({
            "total_rows": state.doc_count(),
            "offset": skip.unwrap_or(0),
            "rows": selector::paginate(rows, skip, limit),
        }))
    }

    async fn bulk_get(
        &self,
        options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let requested = options
            .get("docs")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::bad_request("bulk_get expects a docs array"))?;

        let state = self.store.state.read();
        let results: Vec<Value> = requested
            .iter()
            .map(|entry| {
                let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
                let rev = entry.get("rev").and_then(Value::as_str);
                let found = state
                    .docs
                    .get(id)
                    .filter(|record| rev.map_or(!record.deleted, |rev| rev == record.rev));
                let doc = match found {
                    Some(record) => json!({ "ok": record.render(id, false) }),
                    None => json!({
                        "error": { "id": id, "rev": rev, "error": "not_found", "reason": "missing" }
                    }),
                };
                json!({ "id": id, "docs": [doc] })
            })
            .collect();
        Ok(json!({ "results": results }))
    }

    async fn put_attachment(
        &self,
        doc_id: &str,
        attachment_id: &str,
        rev: Option<&str>,
        attachment: Attachment,
    ) -> EngineResult {
        let change = self.commit(|state| {
            let body = state.live_doc(doc_id).map(|d| d.body.clone()).unwrap_or_default();
            state.write(DocWrite {
                id: doc_id.to_string(),
                expected_rev: rev.map(str::to_string),
                body,
                attachments: AttachmentsUpdate::Put(attachment_id.to_string(), attachment),
                deleted: false,
            })
        })?;
        Ok(write_result(&change))
    }

    async fn get_attachment(
        &self,
        doc_id: &str,
        attachment_id: &str,
        options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let state = self.store.state.read();
        let record = state
            .live_doc(doc_id)
            .ok_or_else(|| EngineError::not_found("missing"))?;
        if let Some(rev) = options.get("rev").and_then(Value::as_str) {
            if rev != record.rev {
                return Err(EngineError::not_found("missing"));
            }
        }
        let attachment = record
            .attachments
            .get(attachment_id)
            .ok_or_else(|| EngineError::not_found(format!("attachment {} is missing", attachment_id)))?;
        Ok(json!({
            "content_type": attachment.content_type,
            "data": attachment.data,
            "length": attachment.data.len(),
        }))
    }

    async fn remove_attachment(
        &self,
        doc_id: &str,
        attachment_id: &str,
        rev: &str,
    ) -> EngineResult {
        let change = self.commit(|state| {
            let body = state
                .live_doc(doc_id)
                .map(|d| d.body.clone())
                .ok_or_else(|| EngineError::not_found("missing"))?;
            state.write(DocWrite {
                id: doc_id.to_string(),
                expected_rev: Some(rev.to_string()),
                body,
                attachments: AttachmentsUpdate::Remove(attachment_id.to_string()),
                deleted: false,
            })
        })?;
        Ok(write_result(&change))
    }

    async fn create_index(
        &self,
        index: Value,
    ) -> EngineResult {
        self.ensure_open()?;
        let def = parse_index(&index)?;
        let mut state = self.store.state.write();
        if state.indexes.contains_key(&def.name) {
            return Ok(json!({ "result": "exists", "id": def.ddoc, "name": def.name }));
        }
        let result = json!({ "result": "created", "id": def.ddoc, "name": def.name });
        state.indexes.insert(def.name.clone(), def);
        Ok(result)
    }

    async fn find(
        &self,
        request: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let selector_value = request
            .get("selector")
            .ok_or_else(|| EngineError::bad_request("selector is required"))?;
        let sort = selector::parse_sort(request.get("sort"))?;
        let skip = selector::usize_option(request, "skip")?;
        let limit = selector::usize_option(request, "limit")?;
        let fields: Option<Vec<String>> = match request.get("fields") {
            None | Some(Value::Null) => None,
            Some(Value::Array(fields)) => Some(fields.iter().filter_map(Value::as_str).map(str::to_string).collect()),
            Some(_) => return Err(EngineError::bad_request("fields must be an array")),
        };

        let mut docs = Vec::new();
        {
            let state = self.store.state.read();
            for (id, record) in state.docs.iter().filter(|(_, r)| !r.deleted) {
                let doc = record.render(id, false);
                if selector::matches(&doc, selector_value)? {
                    docs.push(doc);
                }
            }
        }
        selector::sort_docs(&mut docs, &sort);
        let mut docs = selector::paginate(docs, skip, limit);
        if let Some(fields) = fields {
            docs = docs.iter().map(|doc| selector::project(doc, &fields)).collect();
        }
        Ok(json!({ "docs": docs }))
    }

    async fn explain(
        &self,
        request: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let selector_value = request
            .get("selector")
            .ok_or_else(|| EngineError::bad_request("selector is required"))?;
        let sort = selector::parse_sort(request.get("sort"))?;
        let wanted: Vec<String> = match sort.first() {
            Some((field, _)) => vec![field.clone()],
            None => selector::selector_fields(selector_value),
        };

        let state = self.store.state.read();
        let index = state
            .indexes
            .values()
            .find(|def| def.fields.first().map_or(false, |f| wanted.contains(f)))
            .map(IndexDef::describe)
            .unwrap_or_else(all_docs_index);

        Ok(json!({
            "dbname": self.store.name,
            "index": index,
            "selector": selector_value,
            "opts": {
                "limit": request.get("limit"),
                "skip": request.get("skip"),
                "sort": request.get("sort"),
            },
            "fields": request.get("fields").cloned().unwrap_or_else(|| Value::from("all_fields")),
        }))
    }

    async fn get_indexes(&self) -> EngineResult {
        self.ensure_open()?;
        let state = self.store.state.read();
        let mut indexes = vec![all_docs_index()];
        indexes.extend(state.indexes.values().map(IndexDef::describe));
        Ok(json!({ "total_rows": indexes.len(), "indexes": indexes }))
    }

    async fn delete_index(
        &self,
        index: Value,
    ) -> EngineResult {
        self.ensure_open()?;
        let name = index
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::bad_request("index name is required"))?;
        match self.store.state.write().indexes.remove(name) {
            Some(_) => Ok(json!({ "ok": true })),
            None => Err(EngineError::not_found(format!("index {} does not exist", name))),
        }
    }

    async fn query(
        &self,
        fun: Value,
        options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let view = ViewSpec::parse(&fun)?;
        let include_docs = selector::bool_option(options, "include_docs", false);
        let descending = selector::bool_option(options, "descending", false);
        let inclusive_end = selector::bool_option(options, "inclusive_end", true);
        let skip = selector::usize_option(options, "skip")?;
        let limit = selector::usize_option(options, "limit")?;

        let mut rows: Vec<(Value, String, Value, Value)> = Vec::new();
        {
            let state = self.store.state.read();
            for (id, record) in state.docs.iter().filter(|(_, r)| !r.deleted) {
                let doc = record.render(id, false);
                let Some(key) = selector::field_value(&doc, &view.map).filter(|k| !k.is_null()) else {
                    continue;
                };
                let value = match &view.value {
                    Some(path) => selector::field_value(&doc, path).cloned().unwrap_or(Value::Null),
                    None => Value::Null,
                };
                rows.push((key.clone(), id.clone(), value, doc));
            }
        }

        rows.sort_by(|a, b| selector::collate(&a.0, &b.0).then_with(|| a.1.cmp(&b.1)));
        if descending {
            rows.reverse();
        }

        let (low, high) = if descending {
            (options.get("endkey"), options.get("startkey"))
        } else {
            (options.get("startkey"), options.get("endkey"))
        };
        let exact = options.get("key");
        rows.retain(|(key, _, _, _)| {
            if let Some(exact) = exact {
                return selector::collate(key, exact) == Collation::Equal;
            }
            let above = low.map_or(true, |low| match selector::collate(key, low) {
                Collation::Less => false,
                Collation::Equal => !descending || inclusive_end,
                Collation::Greater => true,
            });
            let below = high.map_or(true, |high| match selector::collate(key, high) {
                Collation::Greater => false,
                Collation::Equal => descending || inclusive_end,
                Collation::Less => true,
            });
            above && below
        });

        let total_rows = rows.len();
        if let Some(reduce) = view.reduce.filter(|_| selector::bool_option(options, "reduce", true)) {
            let group = selector::bool_option(options, "group", false);
            return reduce.apply(rows, group);
        }

        let rows: Vec<Value> = selector::paginate(rows, skip, limit)
            .into_iter()
            .map(|(key, id, value, doc)| {
                let mut row = json!({ "id": id, "key": key, "value": value });
                if include_docs {
                    row["doc"] = doc;
                }
                row
            })
            .collect();

        Ok(json!({ "total_rows": total_rows, "offset": skip.unwrap_or(0), "rows": rows }))
    }

    async fn view_cleanup(&self) -> EngineResult {
        self.ensure_open()?;
        Ok(json!({ "ok": true }))
    }

    async fn info(&self) -> EngineResult {
        self.ensure_open()?;
        let state = self.store.state.read();
        Ok(json!({
            "db_name": self.store.name,
            "doc_count": state.doc_count(),
            "update_seq": state.update_seq,
            "adapter": "memory",
        }))
    }

    async fn compact(
        &self,
        _options: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let mut state = self.store.state.write();
        for record in state.docs.values_mut() {
            record.history.clear();
        }
        Ok(json!({ "ok": true }))
    }

    async fn revs_diff(
        &self,
        diff: &Options,
    ) -> EngineResult {
        self.ensure_open()?;
        let state = self.store.state.read();
        let mut missing_by_id = Map::new();
        for (id, revs) in diff {
            let revs = revs
                .as_array()
                .ok_or_else(|| EngineError::bad_request(format!("revisions of {} must be an array", id)))?;
            let missing: Vec<Value> = revs
                .iter()
                .filter(|rev| {
                    let rev = rev.as_str().unwrap_or_default();
                    state.docs.get(id).map_or(true, |record| !record.knows(rev))
                })
                .cloned()
                .collect();
            if !missing.is_empty() {
                missing_by_id.insert(id.clone(), json!({ "missing": missing }));
            }
        }
        Ok(Value::Object(missing_by_id))
    }

    async fn close(&self) -> EngineResult {
        self.ensure_open()?;
        self.closed.store(true, Ordering::SeqCst);
        debug!(db = %self.store.name, "memory handle closed");
        Ok(Value::Null)
    }

    fn changes(
        &self,
        options: &Options,
    ) -> Result<Feed, EngineError> {
        self.ensure_open()?;
        let since = match options.get("since") {
            None | Some(Value::Null) => Some(0),
            Some(Value::String(s)) if s == "now" => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .ok_or_else(|| EngineError::bad_request("since must be a sequence number or \"now\""))?,
            ),
        };
        let task = ChangesTask::new(
            self.store.clone(),
            since,
            Self::live_option(options),
            selector::bool_option(options, "include_docs", false),
        );
        Ok(self.spawn_feed(|events, token| task.run(events, token)))
    }

    fn replicate(
        &self,
        target: DbHandle,
        options: &Options,
    ) -> Result<Feed, EngineError> {
        self.ensure_open()?;
        let target = self.target_store(&target)?;
        let legs = vec![Leg {
            source: self.store.clone(),
            target,
            direction: None,
            checkpoint: 0,
        }];
        let task = ReplicationTask::new(legs, Self::live_option(options));
        Ok(self.spawn_feed(|events, token| task.run(events, token)))
    }

    fn sync(
        &self,
        target: DbHandle,
        options: &Options,
    ) -> Result<Feed, EngineError> {
        self.ensure_open()?;
        let remote = self.target_store(&target)?;
        let legs = vec![
            Leg {
                source: self.store.clone(),
                target: remote.clone(),
                direction: Some("push"),
                checkpoint: 0,
            },
            Leg {
                source: remote,
                target: self.store.clone(),
                direction: Some("pull"),
                checkpoint: 0,
            },
        ];
        let task = ReplicationTask::new(legs, Self::live_option(options));
        Ok(self.spawn_feed(|events, token| task.run(events, token)))
    }
}

fn all_docs_index() -> Value {
    json!({
        "ddoc": null,
        "name": "_all_docs",
        "type": "special",
        "def": { "fields": [{ "_id": "asc" }] },
    })
}

/// Accepts `{index: {fields}, name?, ddoc?}` or a bare `{fields, name?, ddoc?}`.
fn parse_index(index: &Value) -> Result<IndexDef, EngineError> {
    let spec = index.get("index").unwrap_or(index);
    let raw_fields = spec
        .get("fields")
        .and_then(Value::as_array)
        .filter(|fields| !fields.is_empty())
        .ok_or_else(|| EngineError::bad_request("index needs a non-empty fields array"))?;

    let mut fields = Vec::with_capacity(raw_fields.len());
    for field in raw_fields {
        match field {
            Value::String(name) => fields.push(name.clone()),
            Value::Object(map) if map.len() == 1 => fields.extend(map.keys().cloned()),
            _ => return Err(EngineError::bad_request("invalid index field")),
        }
    }

    let lookup = |key: &str| {
        spec.get(key)
            .or_else(|| index.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let name = lookup("name").unwrap_or_else(|| format!("idx-{}", fields.join("-")));
    let ddoc = match lookup("ddoc") {
        Some(ddoc) if ddoc.starts_with("_design/") => ddoc,
        Some(ddoc) => format!("_design/{}", ddoc),
        None => format!("_design/{}", name),
    };
    Ok(IndexDef { ddoc, name, fields })
}

/// Built-in reduce functions
#[derive(Debug, Clone, Copy)]
enum Reduce {
    Count,
    Sum,
}

impl Reduce {
    fn apply(
        self,
        rows: Vec<(Value, String, Value, Value)>,
        group: bool,
    ) -> EngineResult {
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
        for (key, _, value, _) in rows {
            let key = if group { key } else { Value::Null };
            match groups.last_mut() {
                Some((last, values)) if *last == key => values.push(value),
                _ => groups.push((key, vec![value])),
            }
        }
        if groups.is_empty() && !group {
            groups.push((Value::Null, Vec::new()));
        }

        let mut reduced = Vec::with_capacity(groups.len());
        for (key, values) in groups {
            let value = match self {
                Reduce::Count => Value::from(values.len()),
                Reduce::Sum => {
                    let mut total = 0.0;
                    for value in &values {
                        total += value
                            .as_f64()
                            .ok_or_else(|| EngineError::bad_request("_sum needs numeric values"))?;
                    }
                    json!(total)
                }
            };
            reduced.push(json!({ "key": key, "value": value }));
        }
        Ok(json!({ "rows": reduced }))
    }
}

/// A temporary view: the map emits `(field at map, field at value)`.
#[derive(Debug)]
struct ViewSpec {
    map: String,
    value: Option<String>,
    reduce: Option<Reduce>,
}

impl ViewSpec {
    fn parse(fun: &Value) -> Result<Self, EngineError> {
        let (map, value, reduce) = match fun {
            Value::String(map) => (map.clone(), None, None),
            Value::Object(spec) => {
                let map = spec
                    .get("map")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EngineError::bad_request("view needs a map field path"))?;
                let value = spec.get("value").and_then(Value::as_str).map(str::to_string);
                let reduce = match spec.get("reduce") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(r)) if r == "_count" => Some(Reduce::Count),
                    Some(Value::String(r)) if r == "_sum" => Some(Reduce::Sum),
                    Some(other) => {
                        return Err(EngineError::bad_request(format!("unsupported reduce {}", other)));
                    }
                };
                (map.to_string(), value, reduce)
            }
            _ => return Err(EngineError::bad_request("fun must be a field path or a view object")),
        };
        if map.is_empty() {
            return Err(EngineError::bad_request("view map must not be empty"));
        }
        Ok(Self { map, value, reduce })
    }
}
