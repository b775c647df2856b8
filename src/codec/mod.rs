//! Serialization adapter between host values and engine JSON.
//!
//! The host works with its own typed values; the engine consumes and produces
//! plain JSON objects. Conversion goes through serde in both directions, so
//! field names on the host side become string keys on the engine side and back
//! without renaming.

#[cfg(test)]
mod codec_test;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tracing::warn;

use crate::CodecError;
use crate::EngineError;

/// Document id field
pub const ID_FIELD: &str = "_id";
/// Document revision field
pub const REV_FIELD: &str = "_rev";

/// Converts any serializable host value into engine JSON.
pub fn to_engine<T>(value: &T) -> Result<Value, CodecError>
where
    T: Serialize + ?Sized,
{
    Ok(serde_json::to_value(value)?)
}

/// Converts a host value into an engine document, which must be an object.
pub fn to_document<T>(value: &T) -> Result<Value, CodecError>
where
    T: Serialize + ?Sized,
{
    let doc = to_engine(value)?;
    if !doc.is_object() {
        return Err(CodecError::NotAnObject { found: json_kind(&doc) });
    }
    Ok(doc)
}

/// Converts a host value into an options map.
pub fn to_options<T>(value: &T) -> Result<Map<String, Value>, CodecError>
where
    T: Serialize + ?Sized,
{
    match to_engine(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(CodecError::NotAnObject { found: json_kind(&other) }),
    }
}

/// Converts engine JSON back into a typed host value.
pub fn from_engine<T>(value: Value) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_value(value)?)
}

/// Converts an engine failure into the payload handed to failure receivers.
pub fn error_payload(error: &EngineError) -> Value {
    to_engine(error).unwrap_or_else(|e| {
        warn!("cannot serialize engine error: {}", e);
        json!({ "status": error.status, "error": "internal_error", "reason": error.to_string() })
    })
}

/// Reads `_id` from a document, if it carries a string one.
pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Reads `_rev` from a document, if it carries a string one.
pub fn doc_rev(doc: &Value) -> Option<&str> {
    doc.get(REV_FIELD).and_then(Value::as_str)
}

/// Short name of a JSON value's type, for error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
