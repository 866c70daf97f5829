//! Store configuration and the composition root that wires a store together.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::LoggingAuditStore;
use crate::blob_id::UuidBlobIdGenerator;
use crate::content::FsContentIo;
use crate::digest::HashAlgorithm;
use crate::error::{BlobStoreError, Result};
use crate::metadata::{
    FjallMetadataStore, FlatFileMetadataStore, MemoryMetadataStore, MetadataError, MetadataStore,
};
use crate::paths::HashingSubdirPolicy;
use crate::store::FileBlobStore;

/// Where blob metadata is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataBackend {
    /// In process memory (for testing). Records are lost on restart.
    #[default]
    Memory,

    /// One file per record.
    FlatFile {
        /// Defaults to `<root>/metadata`.
        #[serde(default)]
        path: Option<PathBuf>,
    },

    /// An embedded `fjall` keyspace.
    Fjall {
        /// Defaults to `<root>/metadata`.
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    pub name: String,
    /// Directory below which content files are stored.
    pub root: PathBuf,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    #[serde(default)]
    pub metadata: MetadataBackend,
    /// Log lifecycle events through the audit trail.
    #[serde(default)]
    pub audit: bool,
}

impl BlobStoreConfig {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            hash_algorithm: Default::default(),
            metadata: Default::default(),
            audit: false,
        }
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|err| BlobStoreError::InvalidConfig(err.to_string()))
    }

    fn metadata_path(&self, path: &Option<PathBuf>) -> PathBuf {
        path.clone().unwrap_or_else(|| self.root.join("metadata"))
    }

    /// Builds a [`FileBlobStore`] and all of its collaborators.
    pub async fn open(&self) -> Result<FileBlobStore> {
        if self.name.is_empty() {
            return Err(BlobStoreError::InvalidConfig("store name is empty".into()));
        }
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            BlobStoreError::InvalidConfig(format!(
                "unable to create store root {}: {err}",
                self.root.display()
            ))
        })?;

        let metadata_error = |err: MetadataError| {
            BlobStoreError::InvalidConfig(format!("unable to open metadata store: {err}"))
        };
        let metadata: Arc<dyn MetadataStore> = match &self.metadata {
            MetadataBackend::Memory => {
                tracing::warn!(
                    store = %self.name,
                    "blob metadata is kept in memory, content under {} is unreachable after a restart",
                    self.root.display()
                );
                Arc::new(MemoryMetadataStore::new())
            }
            MetadataBackend::FlatFile { path } => Arc::new(
                FlatFileMetadataStore::open(self.metadata_path(path))
                    .await
                    .map_err(metadata_error)?,
            ),
            MetadataBackend::Fjall { path } => Arc::new(
                FjallMetadataStore::open(self.metadata_path(path)).map_err(metadata_error)?,
            ),
        };

        let mut store = FileBlobStore::new(
            self.name.clone(),
            Arc::new(UuidBlobIdGenerator),
            Arc::new(HashingSubdirPolicy::new(self.root.clone())),
            Arc::new(FsContentIo::new(self.hash_algorithm)),
            metadata,
        );
        if self.audit {
            store = store.with_audit_store(Arc::new(LoggingAuditStore));
        }

        tracing::info!(
            store = %self.name,
            root = %self.root.display(),
            algorithm = %self.hash_algorithm,
            "opened blob store"
        );
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = BlobStoreConfig::from_toml(
            r#"
            name = "releases"
            root = "/var/lib/blobs"
            hash_algorithm = "blake3"
            audit = true

            [metadata]
            type = "fjall"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "releases");
        assert_eq!(config.root, PathBuf::from("/var/lib/blobs"));
        assert_eq!(config.hash_algorithm, HashAlgorithm::Blake3);
        assert_eq!(config.metadata, MetadataBackend::Fjall { path: None });
        assert!(config.audit);
    }

    #[test]
    fn test_defaults() {
        let config = BlobStoreConfig::from_toml(
            r#"
            name = "default"
            root = "blobs"
            "#,
        )
        .unwrap();
        assert_eq!(config, BlobStoreConfig::new("default", "blobs"));
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha1);
        assert_eq!(config.metadata, MetadataBackend::Memory);
    }

    #[test]
    fn test_unknown_algorithm_is_a_config_error() {
        let err = BlobStoreConfig::from_toml(
            r#"
            name = "broken"
            root = "blobs"
            hash_algorithm = "md5"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BlobStoreError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_open_each_backend() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backends = [
            MetadataBackend::Memory,
            MetadataBackend::FlatFile { path: None },
            MetadataBackend::Fjall {
                path: Some(temp_dir.path().join("kv")),
            },
        ];

        for (i, metadata) in backends.into_iter().enumerate() {
            let mut config = BlobStoreConfig::new("test", temp_dir.path().join(i.to_string()));
            config.metadata = metadata;
            assert!(config.open().await.is_ok());
        }
        assert!(temp_dir.path().join("1").join("metadata").is_dir());
        assert!(temp_dir.path().join("kv").is_dir());
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = BlobStoreConfig::new("", temp_dir.path());
        assert!(matches!(
            config.open().await,
            Err(BlobStoreError::InvalidConfig(_))
        ));
    }
}
