//! A local blob store: content files on disk, bookkeeping in a pluggable
//! metadata store.
//!
//! Blobs are created from any [`AsyncRead`](tokio::io::AsyncRead), identified by
//! a generated [`BlobId`], and move through a soft-delete / hard-delete
//! lifecycle. [`BlobStoreConfig::open`] wires a ready-to-use [`FileBlobStore`].

pub mod audit;
pub mod blob_id;
pub mod blobstore;
pub mod config;
pub mod content;
pub mod digest;
pub mod error;
pub mod listener;
pub mod metadata;
pub mod paths;
pub mod store;

pub use audit::{AuditAction, AuditEntry, AuditStore, LoggingAuditStore};
pub use blob_id::{BlobId, BlobIdGenerator, UuidBlobIdGenerator};
pub use blobstore::{Blob, BlobStore, BlobStoreMetrics, AUDIT_INFO_HEADER, BLOB_NAME_HEADER};
pub use config::{BlobStoreConfig, MetadataBackend};
pub use content::{ContentIo, FsContentIo};
pub use digest::{HashAlgorithm, StreamMetrics};
pub use error::{BlobStoreError, Result};
pub use listener::BlobStoreListener;
pub use metadata::{BlobMetadata, BlobMetrics, Headers, MetadataStore};
pub use paths::{HashingSubdirPolicy, PathPolicy};
pub use store::FileBlobStore;
