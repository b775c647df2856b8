use std::fmt;
use std::str::FromStr;

use crate::DispatchError;

/// Operations a request can name.
///
/// Tags are matched case-insensitively and ignore `-` and `_`, so
/// `bulk-docs`, `bulk_docs` and `bulkDocs` all name [`Method::BulkDocs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Put,
    Post,
    Get,
    Remove,
    Destroy,
    BulkDocs,
    AllDocs,
    BulkGet,
    PutAttachment,
    GetAttachment,
    RemoveAttachment,
    CreateIndex,
    Find,
    Explain,
    GetIndexes,
    DeleteIndex,
    Query,
    ViewCleanup,
    Info,
    Compact,
    RevsDiff,
    Close,
    AttachChangeWatcher,
    CancelWatcher,
    Replicate,
    Sync,
    CancelSync,
}

impl Method {
    pub const ALL: [Method; 27] = [
        Method::Put,
        Method::Post,
        Method::Get,
        Method::Remove,
        Method::Destroy,
        Method::BulkDocs,
        Method::AllDocs,
        Method::BulkGet,
        Method::PutAttachment,
        Method::GetAttachment,
        Method::RemoveAttachment,
        Method::CreateIndex,
        Method::Find,
        Method::Explain,
        Method::GetIndexes,
        Method::DeleteIndex,
        Method::Query,
        Method::ViewCleanup,
        Method::Info,
        Method::Compact,
        Method::RevsDiff,
        Method::Close,
        Method::AttachChangeWatcher,
        Method::CancelWatcher,
        Method::Replicate,
        Method::Sync,
        Method::CancelSync,
    ];

    /// Parses a method tag.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::EmptyMethod` for a blank tag and
    /// `DispatchError::UnknownMethod` naming the tag when it matches nothing.
    pub fn parse(value: &str) -> Result<Self, DispatchError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DispatchError::EmptyMethod);
        }

        let normalized: String = trimmed
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        Self::ALL
            .iter()
            .copied()
            .find(|method| method.as_str().replace('-', "") == normalized)
            .ok_or_else(|| DispatchError::unknown_method(trimmed))
    }

    /// Canonical kebab-case tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Post => "post",
            Self::Get => "get",
            Self::Remove => "remove",
            Self::Destroy => "destroy",
            Self::BulkDocs => "bulk-docs",
            Self::AllDocs => "all-docs",
            Self::BulkGet => "bulk-get",
            Self::PutAttachment => "put-attachment",
            Self::GetAttachment => "get-attachment",
            Self::RemoveAttachment => "remove-attachment",
            Self::CreateIndex => "create-index",
            Self::Find => "find",
            Self::Explain => "explain",
            Self::GetIndexes => "get-indexes",
            Self::DeleteIndex => "delete-index",
            Self::Query => "query",
            Self::ViewCleanup => "view-cleanup",
            Self::Info => "info",
            Self::Compact => "compact",
            Self::RevsDiff => "revs-diff",
            Self::Close => "close",
            Self::AttachChangeWatcher => "attach-change-watcher",
            Self::CancelWatcher => "cancel-watcher",
            Self::Replicate => "replicate",
            Self::Sync => "sync",
            Self::CancelSync => "cancel-sync",
        }
    }

    /// Cancel methods act on the identifier alone and never open a database.
    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::CancelWatcher | Self::CancelSync)
    }

    /// Methods whose outcome is delivered through success/failure receivers
    pub fn is_promise(&self) -> bool {
        !matches!(
            self,
            Self::AttachChangeWatcher | Self::CancelWatcher | Self::Replicate | Self::Sync | Self::CancelSync
        )
    }
}

impl FromStr for Method {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Method {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
