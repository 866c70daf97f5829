//! Error types for the blob store.

use std::path::PathBuf;

use crate::blob_id::BlobId;
use crate::metadata::MetadataError;

/// Errors surfaced by [`FileBlobStore`](crate::FileBlobStore) operations.
///
/// A missing blob is not an error: lookups report it as `None` or `false`.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// A required header was absent on `create`. Nothing was persisted.
    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),

    /// Writing or reading blob content failed.
    #[error("blob store '{store}': I/O failure on blob {blob_id}: {source}")]
    Io {
        store: String,
        blob_id: BlobId,
        #[source]
        source: std::io::Error,
    },

    /// The metadata claims a live blob whose content file does not exist.
    #[error("blob store '{store}': content of live blob {blob_id} missing at {}", path.display())]
    Inconsistent {
        store: String,
        blob_id: BlobId,
        path: PathBuf,
    },

    /// The content of a previously returned blob was hard-deleted.
    #[error("blob store '{store}': blob {blob_id} has been deleted")]
    ContentGone { store: String, blob_id: BlobId },

    #[error("blob store '{store}': metadata failure on blob {blob_id}: {source}")]
    Metadata {
        store: String,
        blob_id: BlobId,
        #[source]
        source: MetadataError,
    },

    #[error("blob store '{store}': unable to scan metadata: {source}")]
    MetadataScan {
        store: String,
        #[source]
        source: MetadataError,
    },

    /// Querying the storage volume for free space failed.
    #[error("blob store '{store}': unable to query storage volume: {source}")]
    Volume {
        store: String,
        #[source]
        source: std::io::Error,
    },

    /// The listener rejected an event. The change that triggered it has already happened.
    #[error("blob store '{store}': listener failed on blob {blob_id}: {error:#}")]
    Listener {
        store: String,
        blob_id: BlobId,
        error: anyhow::Error,
    },

    /// Recording an audit entry failed. The audited change has already happened.
    #[error("blob store '{store}': audit store failed on blob {blob_id}: {error:#}")]
    Audit {
        store: String,
        blob_id: BlobId,
        error: anyhow::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;
