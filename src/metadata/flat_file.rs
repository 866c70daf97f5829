use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use super::*;

const EXTENSION: &str = "meta";

/// One postcard-encoded file per record, below `<root>/<xx>/<id>.meta`.
///
/// Records are replaced by writing a sibling temp file and renaming it over
/// the old one, so readers never observe a half-written record. Mutations are
/// serialized within the process; the directory must not be shared between
/// processes.
#[derive(Debug)]
pub struct FlatFileMetadataStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FlatFileMetadataStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, blob_id: &BlobId) -> PathBuf {
        let id = blob_id.as_str();
        let shard = &id[..id.len().min(2)];
        self.root.join(shard).join(format!("{id}.{EXTENSION}"))
    }

    async fn read(&self, path: &Path) -> Result<Option<BlobMetadata>, MetadataError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(BlobMetadata::decode(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, path: &Path, metadata: &BlobMetadata) -> Result<(), MetadataError> {
        let bytes = metadata.encode()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    /// Visits every record on disk.
    ///
    /// Records deleted mid-scan are skipped, as are files that fail to decode.
    async fn scan(&self, mut visit: impl FnMut(BlobMetadata) + Send) -> Result<(), MetadataError> {
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = match tokio::fs::read_dir(shard.path()).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                    continue;
                }
                match self.read(&path).await {
                    Ok(Some(metadata)) => visit(metadata),
                    Ok(None) => {
                        tracing::debug!(path = %path.display(), "metadata record vanished during scan");
                    }
                    Err(MetadataError::Corrupt(err)) => {
                        tracing::warn!(path = %path.display(), "skipping corrupt metadata record: {err}");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for FlatFileMetadataStore {
    async fn add(&self, metadata: &BlobMetadata) -> Result<(), MetadataError> {
        let path = self.record_path(&metadata.blob_id);

        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(MetadataError::Duplicate(metadata.blob_id.clone()));
        }

        let mut record = metadata.clone();
        record.version = 0;
        self.write(&path, &record).await
    }

    async fn get(&self, blob_id: &BlobId) -> Result<Option<BlobMetadata>, MetadataError> {
        self.read(&self.record_path(blob_id)).await
    }

    async fn update(&self, mut metadata: BlobMetadata) -> Result<BlobMetadata, MetadataError> {
        let path = self.record_path(&metadata.blob_id);

        let _guard = self.write_lock.lock().await;
        let Some(existing) = self.read(&path).await? else {
            return Err(MetadataError::NotFound(metadata.blob_id));
        };
        metadata.check_update_of(&existing)?;

        metadata.version += 1;
        self.write(&path, &metadata).await?;
        Ok(metadata)
    }

    async fn delete(&self, blob_id: &BlobId) -> Result<bool, MetadataError> {
        let path = self.record_path(blob_id);

        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn metrics(&self) -> Result<MetadataMetrics, MetadataError> {
        let mut metrics = MetadataMetrics::default();
        self.scan(|metadata| metrics.record(&metadata)).await?;
        Ok(metrics)
    }

    async fn orphans(&self) -> Result<Vec<BlobId>, MetadataError> {
        let mut orphans = vec![];
        self.scan(|metadata| {
            if metadata.is_orphan() {
                orphans.push(metadata.blob_id);
            }
        })
        .await?;
        orphans.sort();
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::blob_id::{BlobIdGenerator, UuidBlobIdGenerator};
    use crate::metadata::test_support;

    #[tokio::test]
    async fn test_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FlatFileMetadataStore::open(temp_dir.path()).await.unwrap();
        test_support::check_lifecycle(&store).await;
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FlatFileMetadataStore::open(temp_dir.path()).await.unwrap();
        test_support::check_stale_update_conflicts(&store).await;
    }

    #[tokio::test]
    async fn test_headers_are_immutable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FlatFileMetadataStore::open(temp_dir.path()).await.unwrap();
        test_support::check_headers_immutable(&store).await;
    }

    #[tokio::test]
    async fn test_scan_skips_foreign_and_corrupt_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FlatFileMetadataStore::open(temp_dir.path()).await.unwrap();

        let metadata = test_support::sample("abcdef", 10);
        store.add(&metadata).await.unwrap();

        std::fs::write(temp_dir.path().join("README"), "not a shard").unwrap();
        std::fs::write(temp_dir.path().join("ab").join("zz.meta"), [0xff; 3]).unwrap();
        std::fs::write(temp_dir.path().join("ab").join("notes.txt"), "ignored").unwrap();

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.blob_count, 1);
        assert_eq!(metrics.total_size, 10);

        let path = temp_dir.path().join("ab").join("abcdef.meta");
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_tolerates_concurrent_deletes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlatFileMetadataStore::open(temp_dir.path()).await.unwrap());

        let ids: Vec<_> = (0..600)
            .map(|_| UuidBlobIdGenerator.create_blob_id())
            .collect();
        for id in &ids {
            store
                .add(&test_support::sample(id.as_str(), 1))
                .await
                .unwrap();
        }

        let deleter = tokio::spawn({
            let store = Arc::clone(&store);
            let doomed = ids[100..].to_vec();
            async move {
                for id in doomed {
                    assert!(store.delete(&id).await.unwrap());
                    tokio::task::yield_now().await;
                }
            }
        });

        let mut scans = 0;
        loop {
            let metrics = store.metrics().await.unwrap();
            assert!(metrics.blob_count >= 100 && metrics.blob_count <= 600);
            assert_eq!(metrics.total_size, metrics.blob_count);
            scans += 1;
            if deleter.is_finished() {
                break;
            }
        }
        deleter.await.unwrap();
        assert!(scans > 0);

        let metrics = store.metrics().await.unwrap();
        assert_eq!(metrics.blob_count, 100);
        assert_eq!(metrics.total_size, 100);
    }
}
