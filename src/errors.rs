//! Effect Dispatcher Error Hierarchy
//!
//! Errors are split by when they surface:
//! - [`DispatchError`]: configuration errors raised synchronously by
//!   `dispatch` before any engine call is made.
//! - [`EngineError`]: operation failures reported by the database engine.
//!   These never escape `dispatch`; they are delivered to the failure receiver.
//! - [`CodecError`]: conversion failures between host values and engine JSON.

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request could not be dispatched
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Database engine rejected an operation
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Host value could not be converted
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Configuration loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Configuration loaded but failed validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Errors raised synchronously while turning a request into an engine call.
///
/// These are programmer errors: the request itself is wrong. They abort the
/// single dispatch call before any side effect and are returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Request line is empty or not a request object
    #[error("malformed request: {message}")]
    MalformedRequest { message: String },

    /// Request carries no method tag
    #[error("request has an empty method")]
    EmptyMethod,

    /// Method tag does not name a supported operation
    #[error("unsupported method: {method}")]
    UnknownMethod { method: String },

    /// Request carries no database reference
    #[error("{method}: request has no db")]
    MissingDb { method: &'static str },

    /// Database could not be opened by the engine
    #[error("cannot resolve database '{name}': {source}")]
    UnresolvedDb {
        name: String,
        #[source]
        source: EngineError,
    },

    /// A field the method requires is absent
    #[error("{method}: missing required field '{field}'")]
    MissingField {
        method: &'static str,
        field: &'static str,
    },

    /// A field is present but unusable
    #[error("{method}: invalid field '{field}': {message}")]
    InvalidField {
        method: &'static str,
        field: &'static str,
        message: String,
    },

    /// Subscription could not be opened by the engine
    #[error("{method}: cannot open subscription on '{name}': {source}")]
    Subscription {
        method: &'static str,
        name: String,
        #[source]
        source: EngineError,
    },

    /// Request payload could not be converted for the engine
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl DispatchError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest { message: message.into() }
    }

    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod { method: method.into() }
    }

    pub fn unresolved_db(
        name: impl Into<String>,
        source: EngineError,
    ) -> Self {
        Self::UnresolvedDb {
            name: name.into(),
            source,
        }
    }

    pub fn missing_field(
        method: &'static str,
        field: &'static str,
    ) -> Self {
        Self::MissingField { method, field }
    }

    pub fn invalid_field(
        method: &'static str,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            method,
            field,
            message: message.into(),
        }
    }

    pub fn subscription(
        method: &'static str,
        name: impl Into<String>,
        source: EngineError,
    ) -> Self {
        Self::Subscription {
            method,
            name: name.into(),
            source,
        }
    }
}

/// Failure reported by the database engine for a single operation.
///
/// Shaped like the error objects of CouchDB-style stores so that it can be
/// handed to a failure receiver as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{status} {error}: {reason}")]
pub struct EngineError {
    /// HTTP-like status code
    pub status: u16,
    /// Short machine-readable error name
    pub error: String,
    /// Human-readable explanation
    pub reason: String,
}

impl EngineError {
    pub fn new(
        status: u16,
        error: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error: error.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(400, "bad_request", reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(404, "not_found", reason)
    }

    pub fn conflict() -> Self {
        Self::new(409, "conflict", "Document update conflict")
    }

    pub fn closed(name: &str) -> Self {
        Self::new(412, "database_closed", format!("database {} is closed", name))
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(500, "internal_error", reason)
    }
}

/// Conversion failures between host values and engine JSON
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// serde could not serialize or deserialize the value
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// A document must be a JSON object
    #[error("expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },
}
