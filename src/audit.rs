//! Audit trail of blob lifecycle events.

use core::fmt;

use chrono::{DateTime, Utc};

use crate::blob_id::BlobId;
use crate::blobstore::{AUDIT_INFO_HEADER, BLOB_NAME_HEADER};
use crate::metadata::BlobMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    Create,
    DeleteRequest,
    Purge,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::DeleteRequest => "DELETE_REQUEST",
            Self::Purge => "PURGE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of one lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub store_name: String,
    pub blob_id: BlobId,
    pub action: AuditAction,
    pub blob_name: String,
    /// Taken from the audit-info header the blob was created with.
    pub principal: String,
}

impl AuditEntry {
    pub fn new(store_name: &str, action: AuditAction, metadata: &BlobMetadata) -> Self {
        let header = |key: &str| metadata.headers.get(key).cloned().unwrap_or_default();
        Self {
            timestamp: Utc::now(),
            store_name: store_name.into(),
            blob_id: metadata.blob_id.clone(),
            action,
            blob_name: header(BLOB_NAME_HEADER),
            principal: header(AUDIT_INFO_HEADER),
        }
    }
}

/// Single-line rendering for log based sinks.
impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} : {}/{} {} '{}' by {}",
            self.timestamp.timestamp_millis(),
            self.store_name,
            self.blob_id,
            self.action,
            self.blob_name,
            self.principal
        )
    }
}

/// Durable destination for [`AuditEntry`]s.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    async fn add(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Writes every entry as an `info` event on the `fileblob::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAuditStore;

#[async_trait::async_trait]
impl AuditStore for LoggingAuditStore {
    async fn add(&self, entry: AuditEntry) -> anyhow::Result<()> {
        tracing::info!(target: "fileblob::audit", "{entry}");
        Ok(())
    }
}
