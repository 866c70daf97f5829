//! Blob bookkeeping records and the pluggable stores that hold them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob_id::BlobId;

pub mod fjall_impl;
pub mod flat_file;
pub mod mem_impl;

pub use fjall_impl::FjallMetadataStore;
pub use flat_file::FlatFileMetadataStore;
pub use mem_impl::MemoryMetadataStore;

pub type Headers = BTreeMap<String, String>;

/// Facts about blob content, fixed once its write completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetrics {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_time: DateTime<Utc>,
    /// Hex digest of the content.
    pub content_hash: String,
    pub content_size: u64,
}

/// The durable bookkeeping record of one blob.
///
/// A record is `pending` (marked for deletion, no metrics) until its content
/// is written, `live` afterwards, and marked for deletion again once
/// soft-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub blob_id: BlobId,
    pub headers: Headers,
    pub marked_for_deletion: bool,
    pub metrics: Option<BlobMetrics>,
    /// Stamped by the [`MetadataStore`]; an `update` must carry the version it
    /// last read.
    pub version: u64,
}

impl BlobMetadata {
    /// Checks that `self` is an acceptable replacement for `existing`.
    pub(crate) fn check_update_of(&self, existing: &BlobMetadata) -> Result<(), MetadataError> {
        if existing.version != self.version {
            return Err(MetadataError::Conflict {
                blob_id: self.blob_id.clone(),
                expected: self.version,
            });
        }
        if existing.headers != self.headers {
            return Err(MetadataError::HeadersChanged(self.blob_id.clone()));
        }
        Ok(())
    }

    /// A new pending record.
    pub fn new(blob_id: BlobId, headers: Headers) -> Self {
        Self {
            blob_id,
            headers,
            marked_for_deletion: true,
            metrics: None,
            version: 0,
        }
    }

    /// Whether this record belongs to a write that never completed.
    pub fn is_orphan(&self) -> bool {
        self.marked_for_deletion && self.metrics.is_none()
    }

    pub fn content_size(&self) -> u64 {
        self.metrics.as_ref().map_or(0, |m| m.content_size)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Aggregate over every record in a store, soft-deleted ones included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetadataMetrics {
    pub blob_count: u64,
    pub total_size: u64,
}

impl MetadataMetrics {
    pub(crate) fn record(&mut self, metadata: &BlobMetadata) {
        self.blob_count += 1;
        self.total_size += metadata.content_size();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata for blob {0} already exists")]
    Duplicate(BlobId),

    #[error("metadata for blob {0} not found")]
    NotFound(BlobId),

    /// The record changed since the caller read it.
    #[error("metadata for blob {blob_id} was modified concurrently (expected version {expected})")]
    Conflict { blob_id: BlobId, expected: u64 },

    /// Headers are fixed when a record is added.
    #[error("headers of blob {0} cannot be changed")]
    HeadersChanged(BlobId),

    #[error("corrupt metadata record: {0}")]
    Corrupt(#[from] postcard::Error),

    #[error("key-value store error: {0}")]
    Kv(#[from] fjall::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage for [`BlobMetadata`] records, keyed by blob id.
///
/// Implementations are independent of where blob content lives.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Inserts a new record with version `0`.
    ///
    /// Fails with [`MetadataError::Duplicate`] if the id is already present.
    async fn add(&self, metadata: &BlobMetadata) -> Result<(), MetadataError>;

    async fn get(&self, blob_id: &BlobId) -> Result<Option<BlobMetadata>, MetadataError>;

    /// Replaces an existing record and returns it with its new version.
    ///
    /// Fails with [`MetadataError::NotFound`] if there is no record, with
    /// [`MetadataError::Conflict`] if `metadata.version` is not the stored version,
    /// and with [`MetadataError::HeadersChanged`] if the headers differ from the stored ones.
    async fn update(&self, metadata: BlobMetadata) -> Result<BlobMetadata, MetadataError>;

    /// Removes a record, returning whether it existed.
    async fn delete(&self, blob_id: &BlobId) -> Result<bool, MetadataError>;

    /// Counts all records and sums their content sizes.
    ///
    /// Records that vanish or change while scanning are skipped.
    async fn metrics(&self) -> Result<MetadataMetrics, MetadataError>;

    /// Ids of records whose initial write never completed.
    async fn orphans(&self) -> Result<Vec<BlobId>, MetadataError>;
}
