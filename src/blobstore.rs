use core::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::blob_id::BlobId;
use crate::content::{ContentIo, ContentReader};
use crate::error::{BlobStoreError, Result};
use crate::listener::BlobStoreListener;
use crate::metadata::{BlobMetrics, Headers};

/// Human readable label of a blob. Required on `create`.
pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";
/// Free-text provenance of a blob, recorded as the audit principal. Required on `create`.
pub const AUDIT_INFO_HEADER: &str = "BlobStore.audit-info";

/// Capacity figures of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStoreMetrics {
    /// All blobs that have not been hard-deleted.
    pub blob_count: u64,
    pub total_size: u64,
    /// Free space on the storage volume, queried live.
    pub available_space: u64,
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &str;

    /// Stores `content` under a freshly generated id.
    ///
    /// `headers` must contain [`BLOB_NAME_HEADER`] and [`AUDIT_INFO_HEADER`].
    async fn create<R>(&self, content: R, headers: Headers) -> Result<Blob>
    where
        R: AsyncRead + Send + Unpin;

    /// Returns `None` for unknown, soft-deleted and incompletely written blobs.
    async fn get(&self, blob_id: &BlobId) -> Result<Option<Blob>>;

    /// Marks a blob as deleted, leaving its content in place.
    ///
    /// Returns `false` if the blob is unknown or already marked.
    async fn delete(&self, blob_id: &BlobId) -> Result<bool>;

    /// Removes content and metadata of a blob.
    ///
    /// Returns whether the content file existed.
    async fn delete_hard(&self, blob_id: &BlobId) -> Result<bool>;

    async fn metrics(&self) -> Result<BlobStoreMetrics>;

    fn set_listener(&self, listener: Option<Arc<dyn BlobStoreListener>>);

    fn listener(&self) -> Option<Arc<dyn BlobStoreListener>>;
}

/// A stored blob: its headers, metrics and a handle to lazily read its content.
#[derive(Clone)]
pub struct Blob {
    pub(crate) id: BlobId,
    pub(crate) headers: Headers,
    pub(crate) metrics: BlobMetrics,
    pub(crate) store_name: Arc<str>,
    pub(crate) content_path: PathBuf,
    pub(crate) files: Arc<dyn ContentIo>,
}

impl Blob {
    pub fn id(&self) -> &BlobId {
        &self.id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn metrics(&self) -> &BlobMetrics {
        &self.metrics
    }

    pub fn blob_name(&self) -> Option<&str> {
        self.headers.get(BLOB_NAME_HEADER).map(String::as_str)
    }

    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    /// Opens the content for reading.
    ///
    /// Fails with [`BlobStoreError::ContentGone`] once the blob has been
    /// hard-deleted. Readers opened before that keep working.
    pub async fn open(&self) -> Result<ContentReader> {
        match self.files.open_read(&self.content_path).await {
            Ok(reader) => Ok(reader),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::ContentGone {
                    store: self.store_name.to_string(),
                    blob_id: self.id.clone(),
                })
            }
            Err(source) => Err(BlobStoreError::Io {
                store: self.store_name.to_string(),
                blob_id: self.id.clone(),
                source,
            }),
        }
    }

    /// Reads the whole content into memory.
    pub async fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut reader = self.open().await?;
        let mut content = Vec::with_capacity(self.metrics.content_size as usize);
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|source| BlobStoreError::Io {
                store: self.store_name.to_string(),
                blob_id: self.id.clone(),
                source,
            })?;
        Ok(content)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.id)
            .field("headers", &self.headers)
            .field("metrics", &self.metrics)
            .field("content_path", &self.content_path)
            .finish()
    }
}
