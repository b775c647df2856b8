//! Effect Dispatcher
//!
//! Turns a declarative [`Request`] into a call on the database engine.
//! Everything that can be wrong with the request itself (unknown method,
//! missing database, missing or unusable fields) is reported synchronously
//! as a [`DispatchError`] before the engine is touched. Engine outcomes are
//! delivered later, on a spawned task, through the request's receivers.

mod method;
mod request;


pub use method::*;
pub use request::*;

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;

use crate::codec;
use crate::engine::Attachment;
use crate::engine::DatabaseEngine;
use crate::engine::DbHandle;
use crate::engine::EngineResult;
use crate::engine::Options;
use crate::receiver::Completion;
use crate::receiver::EventBus;
use crate::receiver::Receiver;
use crate::subscription::Handlers;
use crate::DbName;
use crate::DbRef;
use crate::DispatchConfig;
use crate::DispatchError;
use crate::HandleRegistry;
use crate::Settings;
use crate::Subscription;
use crate::SubscriptionManager;
use crate::DISPATCH_TARGET;

/// What `dispatch` started
#[derive(Debug)]
pub enum Dispatched {
    /// A promise operation; the task completes after a receiver fired
    Pending(JoinHandle<()>),
    /// A change watcher or sync session was stored
    Subscribed,
    /// A cancel request was applied (whether or not anything was running)
    Cancelled,
    /// A one-shot replication; not cached, owned by the caller
    Replicating(Subscription),
}

impl Dispatched {
    /// Waits until the outcome of a promise operation has been delivered.
    /// Returns immediately for every other kind.
    pub async fn settled(self) {
        if let Self::Pending(task) = self {
            if let Err(e) = task.await {
                debug!(target: DISPATCH_TARGET, error = %e, "dispatch task did not finish");
            }
        }
    }
}

/// An engine operation with its arguments checked
#[derive(Debug)]
enum Call {
    Put(Value),
    Post(Value),
    Get(String),
    Remove {
        doc_id: String,
        rev: String,
    },
    Destroy,
    BulkDocs(Vec<Value>),
    AllDocs,
    BulkGet,
    PutAttachment {
        doc_id: String,
        attachment_id: String,
        rev: Option<String>,
        attachment: Attachment,
    },
    GetAttachment {
        doc_id: String,
        attachment_id: String,
    },
    RemoveAttachment {
        doc_id: String,
        attachment_id: String,
        rev: String,
    },
    CreateIndex(Value),
    Find,
    Explain,
    GetIndexes,
    DeleteIndex(Value),
    Query(Value),
    ViewCleanup,
    Info,
    Compact,
    RevsDiff,
    Close,
}

impl Call {
    async fn run(
        self,
        db: &DbHandle,
        options: &Options,
    ) -> EngineResult {
        match self {
            Call::Put(doc) => db.put(doc, options).await,
            Call::Post(doc) => db.post(doc, options).await,
            Call::Get(doc_id) => db.get(&doc_id, options).await,
            Call::Remove { doc_id, rev } => db.remove(&doc_id, &rev, options).await,
            Call::Destroy => db.destroy(options).await,
            Call::BulkDocs(docs) => db.bulk_docs(docs, options).await,
            Call::AllDocs => db.all_docs(options).await,
            Call::BulkGet => db.bulk_get(options).await,
            Call::PutAttachment {
                doc_id,
                attachment_id,
                rev,
                attachment,
            } => {
                db.put_attachment(&doc_id, &attachment_id, rev.as_deref(), attachment)
                    .await
            }
            Call::GetAttachment { doc_id, attachment_id } => db.get_attachment(&doc_id, &attachment_id, options).await,
            Call::RemoveAttachment {
                doc_id,
                attachment_id,
                rev,
            } => db.remove_attachment(&doc_id, &attachment_id, &rev).await,
            Call::CreateIndex(index) => db.create_index(index).await,
            Call::Find => db.find(options).await,
            Call::Explain => db.explain(options).await,
            Call::GetIndexes => db.get_indexes().await,
            Call::DeleteIndex(index) => db.delete_index(index).await,
            Call::Query(fun) => db.query(fun, options).await,
            Call::ViewCleanup => db.view_cleanup().await,
            Call::Info => db.info().await,
            Call::Compact => db.compact(options).await,
            Call::RevsDiff => db.revs_diff(options).await,
            Call::Close => db.close().await,
        }
    }

    /// Whether success leaves the handle unusable, so its entry must go.
    fn releases_handle(&self) -> bool {
        matches!(self, Call::Close | Call::Destroy)
    }
}

/// Field access that reports which method needed the missing field
struct Fields<'a> {
    method: &'static str,
    request: &'a mut Request,
}

impl Fields<'_> {
    fn take<T>(
        &mut self,
        field: &'static str,
        pick: impl FnOnce(&mut Request) -> Option<T>,
    ) -> Result<T, DispatchError> {
        pick(&mut *self.request).ok_or_else(|| DispatchError::missing_field(self.method, field))
    }

    fn doc(&mut self) -> Result<Value, DispatchError> {
        let doc = self.take("doc", |r| r.doc.take())?;
        if !doc.is_object() {
            return Err(DispatchError::invalid_field(
                self.method,
                "doc",
                format!("expected a JSON object, found {}", codec::json_kind(&doc)),
            ));
        }
        Ok(doc)
    }

    fn doc_id(&mut self) -> Result<String, DispatchError> {
        self.take("doc-id", |r| r.doc_id.take())
    }

    fn rev(&mut self) -> Result<String, DispatchError> {
        self.take("rev", |r| r.rev.take())
    }

    fn attachment_id(&mut self) -> Result<String, DispatchError> {
        self.take("attachment-id", |r| r.attachment_id.take())
    }
}

pub struct EffectDispatcher {
    registry: Arc<HandleRegistry>,
    subscriptions: SubscriptionManager,
    bus: Arc<dyn EventBus>,
    config: DispatchConfig,
}

impl EffectDispatcher {
    pub fn new(
        engine: Arc<dyn DatabaseEngine>,
        bus: Arc<dyn EventBus>,
        settings: &Settings,
    ) -> Self {
        let registry = Arc::new(HandleRegistry::new(engine));
        let subscriptions = SubscriptionManager::new(registry.clone(), bus.clone(), settings.subscription.clone());
        Self {
            registry,
            subscriptions,
            bus,
            config: settings.dispatch.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Performs one request.
    ///
    /// Returns once the operation has been started; promise operations
    /// report through `success`/`failure` from a spawned task, so this must
    /// be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError` for requests that cannot be performed at all.
    /// No engine call has been made in that case.
    pub fn dispatch(
        &self,
        mut request: Request,
    ) -> Result<Dispatched, DispatchError> {
        let method = Method::parse(&request.method)?;
        let db = request
            .db
            .take()
            .ok_or(DispatchError::MissingDb { method: method.as_str() })?;
        debug!(target: DISPATCH_TARGET, method = method.as_str(), db = %db.name(), "dispatching");

        if method.is_cancel() {
            match method {
                Method::CancelWatcher => self.cancel_watcher(&db),
                _ => self.cancel_sync(&db),
            }
            return Ok(Dispatched::Cancelled);
        }

        let options = match request.options.take() {
            Some(options) => codec::to_options(&options)
                .map_err(|e| DispatchError::invalid_field(method.as_str(), "options", e.to_string()))?,
            None => Options::new(),
        };
        if let Some(doc) = &request.doc {
            if request.doc_id.is_none() {
                request.doc_id = codec::doc_id(doc).map(str::to_string);
            }
            if request.rev.is_none() {
                request.rev = codec::doc_rev(doc).map(str::to_string);
            }
        }

        let fields = Fields {
            method: method.as_str(),
            request: &mut request,
        };
        if !method.is_promise() {
            return self.open_session(method, &db, options, fields);
        }
        let call = Self::prepare(method, fields)?;

        let handle = self.registry.resolve(&db)?;
        let completion = Completion::new(
            method.as_str(),
            request.success.as_ref(),
            request.failure.as_ref(),
            &self.bus,
            self.config.log_unhandled_failures,
        );
        let registry = self.registry.clone();
        let name = db.name();

        let task = tokio::spawn(async move {
            let releases_handle = call.releases_handle();
            let result = call.run(&handle, &options).await;
            trace!(target: DISPATCH_TARGET, method = method.as_str(), db = %name, ok = result.is_ok(), "operation finished");
            if releases_handle && result.is_ok() {
                registry.evict(&name, &handle);
            }
            completion.complete(result);
        });
        Ok(Dispatched::Pending(task))
    }

    /// Starts a change watcher, sync session or replication.
    fn open_session(
        &self,
        method: Method,
        db: &DbRef,
        options: Options,
        mut fields: Fields<'_>,
    ) -> Result<Dispatched, DispatchError> {
        match method {
            Method::AttachChangeWatcher => {
                let handler = fields.take("handler", |r| r.handler.take())?;
                self.attach_change_watcher(db, options, &handler)?;
                Ok(Dispatched::Subscribed)
            }
            Method::Sync => {
                let target = fields.take("target", |r| r.target.take())?;
                let handlers = fields.request.handlers.take().unwrap_or_default();
                self.start_sync(db, &target, options, &handlers)?;
                Ok(Dispatched::Subscribed)
            }
            Method::Replicate => {
                let target = fields.take("target", |r| r.target.take())?;
                let handlers = fields.request.handlers.take().unwrap_or_default();
                let subscription = self
                    .subscriptions
                    .replicate(db, &target, options, &handlers, fields.request.outbound)?;
                Ok(Dispatched::Replicating(subscription))
            }
            other => Err(DispatchError::unknown_method(other.as_str())),
        }
    }

    /// Checks the fields of a promise operation.
    fn prepare(
        method: Method,
        mut fields: Fields<'_>,
    ) -> Result<Call, DispatchError> {
        let call = match method {
            Method::Put => Call::Put(fields.doc()?),
            Method::Post => Call::Post(fields.doc()?),
            Method::Get => Call::Get(fields.doc_id()?),
            Method::Remove => Call::Remove {
                doc_id: fields.doc_id()?,
                rev: fields.rev()?,
            },
            Method::Destroy => Call::Destroy,
            Method::BulkDocs => Call::BulkDocs(fields.take("docs", |r| r.docs.take())?),
            Method::AllDocs => Call::AllDocs,
            Method::BulkGet => Call::BulkGet,
            Method::PutAttachment => {
                let doc_id = fields.doc_id()?;
                let attachment_id = fields.attachment_id()?;
                let data = fields.take("attachment", |r| r.attachment.take())?;
                let content_type = fields.take("attachment-type", |r| r.attachment_type.take())?;
                Call::PutAttachment {
                    doc_id,
                    attachment_id,
                    rev: fields.request.rev.take(),
                    attachment: Attachment { content_type, data },
                }
            }
            Method::GetAttachment => Call::GetAttachment {
                doc_id: fields.doc_id()?,
                attachment_id: fields.attachment_id()?,
            },
            Method::RemoveAttachment => Call::RemoveAttachment {
                doc_id: fields.doc_id()?,
                attachment_id: fields.attachment_id()?,
                rev: fields.rev()?,
            },
            Method::CreateIndex => Call::CreateIndex(fields.take("index", |r| r.index.take())?),
            Method::Find => Call::Find,
            Method::Explain => Call::Explain,
            Method::GetIndexes => Call::GetIndexes,
            Method::DeleteIndex => Call::DeleteIndex(fields.take("index", |r| r.index.take())?),
            Method::Query => Call::Query(fields.take("fun", |r| r.fun.take())?),
            Method::ViewCleanup => Call::ViewCleanup,
            Method::Info => Call::Info,
            Method::Compact => Call::Compact,
            Method::RevsDiff => Call::RevsDiff,
            Method::Close => Call::Close,
            Method::AttachChangeWatcher
            | Method::CancelWatcher
            | Method::Replicate
            | Method::Sync
            | Method::CancelSync => return Err(DispatchError::unknown_method(method.as_str())),
        };
        Ok(call)
    }

    /// Returns the handle a request naming `db` would use.
    pub fn resolve_handle(
        &self,
        db: impl Into<DbRef>,
    ) -> Result<DbHandle, DispatchError> {
        self.registry.resolve(&db.into())
    }

    pub fn attach_change_watcher(
        &self,
        db: &DbRef,
        options: Options,
        handler: &Receiver,
    ) -> Result<(), DispatchError> {
        self.subscriptions.attach_change_watcher(db, options, handler)
    }

    pub fn cancel_watcher(
        &self,
        db: &DbRef,
    ) {
        self.subscriptions.cancel_watcher(db)
    }

    pub fn start_sync(
        &self,
        db: &DbRef,
        target: &DbRef,
        options: Options,
        handlers: &Handlers,
    ) -> Result<(), DispatchError> {
        self.subscriptions.start_sync(db, target, options, handlers)
    }

    pub fn cancel_sync(
        &self,
        db: &DbRef,
    ) {
        self.subscriptions.cancel_sync(db)
    }

    /// Cancels every subscription and forgets every handle.
    pub fn shutdown(&self) {
        debug!(target: DISPATCH_TARGET, handles = self.registry.len(), "shutting down");
        self.registry.clear();
    }

    /// Whether `name` currently has a cached handle
    pub fn is_open(
        &self,
        name: &DbName,
    ) -> bool {
        self.registry.contains(name.as_str())
    }
}
