//! Requests handed to the dispatcher, and their JSON wire form.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::codec;
use crate::receiver::EventTag;
use crate::receiver::Receiver;
use crate::subscription::Handlers;
use crate::CodecError;
use crate::DbRef;
use crate::DispatchError;

/// One side-effect request.
///
/// `method` selects the operation; every other field is optional and only
/// read by the methods that need it.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub db: Option<DbRef>,
    pub doc: Option<Value>,
    pub doc_id: Option<String>,
    pub rev: Option<String>,
    pub attachment: Option<Vec<u8>>,
    pub attachment_id: Option<String>,
    pub attachment_type: Option<String>,
    pub docs: Option<Vec<Value>>,
    pub index: Option<Value>,
    pub fun: Option<Value>,
    pub options: Option<Value>,
    pub success: Option<Receiver>,
    pub failure: Option<Receiver>,
    pub handler: Option<Receiver>,
    pub handlers: Option<Handlers>,
    pub target: Option<DbRef>,
    pub outbound: bool,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn db(
        mut self,
        db: impl Into<DbRef>,
    ) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn doc(
        mut self,
        doc: Value,
    ) -> Self {
        self.doc = Some(doc);
        self
    }

    /// Sets `doc` from any serializable host value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the value does not serialize to a JSON object.
    pub fn typed_doc<T>(
        self,
        doc: &T,
    ) -> Result<Self, CodecError>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.doc(codec::to_document(doc)?))
    }

    pub fn doc_id(
        mut self,
        doc_id: impl Into<String>,
    ) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn rev(
        mut self,
        rev: impl Into<String>,
    ) -> Self {
        self.rev = Some(rev.into());
        self
    }

    pub fn attachment(
        mut self,
        attachment_id: impl Into<String>,
        data: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        self.attachment_id = Some(attachment_id.into());
        self.attachment = Some(data);
        self.attachment_type = Some(content_type.into());
        self
    }

    pub fn attachment_id(
        mut self,
        attachment_id: impl Into<String>,
    ) -> Self {
        self.attachment_id = Some(attachment_id.into());
        self
    }

    pub fn docs(
        mut self,
        docs: Vec<Value>,
    ) -> Self {
        self.docs = Some(docs);
        self
    }

    pub fn index(
        mut self,
        index: Value,
    ) -> Self {
        self.index = Some(index);
        self
    }

    pub fn fun(
        mut self,
        fun: Value,
    ) -> Self {
        self.fun = Some(fun);
        self
    }

    pub fn options(
        mut self,
        options: Value,
    ) -> Self {
        self.options = Some(options);
        self
    }

    pub fn success(
        mut self,
        receiver: impl Into<Receiver>,
    ) -> Self {
        self.success = Some(receiver.into());
        self
    }

    pub fn failure(
        mut self,
        receiver: impl Into<Receiver>,
    ) -> Self {
        self.failure = Some(receiver.into());
        self
    }

    pub fn handler(
        mut self,
        receiver: impl Into<Receiver>,
    ) -> Self {
        self.handler = Some(receiver.into());
        self
    }

    /// Adds a receiver for the engine event called `event`.
    pub fn on(
        mut self,
        event: impl Into<String>,
        receiver: impl Into<Receiver>,
    ) -> Self {
        self.handlers
            .get_or_insert_with(Handlers::new)
            .insert(event.into(), receiver.into());
        self
    }

    pub fn target(
        mut self,
        target: impl Into<DbRef>,
    ) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn outbound(
        mut self,
        outbound: bool,
    ) -> Self {
        self.outbound = outbound;
        self
    }
}

/// Attachment payload on the wire: UTF-8 text or raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttachmentData {
    Text(String),
    Bytes(Vec<u8>),
}

impl AttachmentData {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

/// JSON form of a [`Request`], one per line on the host shim's input.
///
/// Keys are kebab-case; databases are named by string and receivers are
/// event tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequestSpec {
    pub method: String,
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub doc: Option<Value>,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub attachment: Option<AttachmentData>,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub attachment_type: Option<String>,
    #[serde(default)]
    pub docs: Option<Vec<Value>>,
    #[serde(default)]
    pub index: Option<Value>,
    #[serde(default)]
    pub fun: Option<Value>,
    #[serde(default)]
    pub options: Option<Value>,
    #[serde(default)]
    pub success: Option<EventTag>,
    #[serde(default)]
    pub failure: Option<EventTag>,
    #[serde(default)]
    pub handler: Option<EventTag>,
    #[serde(default)]
    pub handlers: Option<BTreeMap<String, EventTag>>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub outbound: bool,
}

impl RequestSpec {
    /// Parses one JSON line. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::MalformedRequest` for a blank line and
    /// `DispatchError::Codec` when the line is not a request object.
    pub fn parse(line: &str) -> Result<Self, DispatchError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(DispatchError::malformed("empty request line"));
        }
        let spec = serde_json::from_str(trimmed).map_err(CodecError::from)?;
        Ok(spec)
    }
}

impl From<RequestSpec> for Request {
    fn from(spec: RequestSpec) -> Self {
        Request {
            method: spec.method,
            db: spec.db.map(DbRef::from),
            doc: spec.doc,
            doc_id: spec.doc_id,
            rev: spec.rev,
            attachment: spec.attachment.map(AttachmentData::into_bytes),
            attachment_id: spec.attachment_id,
            attachment_type: spec.attachment_type,
            docs: spec.docs,
            index: spec.index,
            fun: spec.fun,
            options: spec.options,
            success: spec.success.map(Receiver::Event),
            failure: spec.failure.map(Receiver::Event),
            handler: spec.handler.map(Receiver::Event),
            handlers: spec.handlers.map(|handlers| {
                handlers
                    .into_iter()
                    .map(|(event, tag)| (event, Receiver::Event(tag)))
                    .collect()
            }),
            target: spec.target.map(DbRef::from),
            outbound: spec.outbound,
        }
    }
}
