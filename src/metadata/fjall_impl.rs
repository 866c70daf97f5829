use std::path::Path;

use fjall::{TransactionalKeyspace, TransactionalPartitionHandle};
use tempfile::TempDir;

use super::*;

const PARTITION: &str = "blob_metadata";

/// Records in an embedded `fjall` keyspace, one key per blob id.
///
/// Mutations run in serializable transactions, so a racing writer either
/// fails the version check or loses the commit with a conflict.
pub struct FjallMetadataStore {
    database: TransactionalKeyspace,
    records: TransactionalPartitionHandle,
    // Only set for throwaway stores. Must be dropped after the keyspace.
    _tempdir: Option<TempDir>,
}

impl FjallMetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let database = fjall::Config::new(path.as_ref()).open_transactional()?;
        Self::from_keyspace(database, None)
    }

    /// A store in a fresh temporary directory, removed on drop.
    pub fn temporary() -> Result<Self, MetadataError> {
        let tempdir = tempfile::tempdir()?;
        let database = fjall::Config::new(tempdir.path()).open_transactional()?;
        Self::from_keyspace(database, Some(tempdir))
    }

    fn from_keyspace(
        database: TransactionalKeyspace,
        tempdir: Option<TempDir>,
    ) -> Result<Self, MetadataError> {
        let records = database.open_partition(PARTITION, Default::default())?;
        Ok(Self {
            database,
            records,
            _tempdir: tempdir,
        })
    }

    /// Visits every decodable record, skipping entries that fail to read.
    fn scan(&self, mut visit: impl FnMut(BlobMetadata)) {
        let read_tx = self.database.read_tx();
        for item in read_tx.iter(&self.records) {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(err) => {
                    tracing::debug!("skipping unreadable metadata entry: {err}");
                    continue;
                }
            };
            match BlobMetadata::decode(&value) {
                Ok(metadata) => visit(metadata),
                Err(err) => {
                    let key = String::from_utf8_lossy(&key);
                    tracing::debug!(key = %key, "skipping undecodable metadata entry: {err}");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl MetadataStore for FjallMetadataStore {
    async fn add(&self, metadata: &BlobMetadata) -> Result<(), MetadataError> {
        let key = metadata.blob_id.as_str().as_bytes();
        let mut record = metadata.clone();
        record.version = 0;
        let value = record.encode()?;

        let mut write_tx = self.database.write_tx()?;
        if write_tx.contains_key(&self.records, key)? {
            return Err(MetadataError::Duplicate(metadata.blob_id.clone()));
        }
        write_tx.insert(&self.records, key, value);

        match write_tx.commit()? {
            Ok(()) => {
                tracing::debug!(blob_id = %metadata.blob_id, "added metadata");
                Ok(())
            }
            // Somebody committed the same key in between.
            Err(_conflict) => Err(MetadataError::Duplicate(metadata.blob_id.clone())),
        }
    }

    async fn get(&self, blob_id: &BlobId) -> Result<Option<BlobMetadata>, MetadataError> {
        let read_tx = self.database.read_tx();
        match read_tx.get(&self.records, blob_id.as_str().as_bytes())? {
            Some(value) => Ok(Some(BlobMetadata::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, mut metadata: BlobMetadata) -> Result<BlobMetadata, MetadataError> {
        let key = metadata.blob_id.as_str().as_bytes().to_vec();

        let mut write_tx = self.database.write_tx()?;
        let Some(existing) = write_tx.get(&self.records, &key)? else {
            return Err(MetadataError::NotFound(metadata.blob_id));
        };
        metadata.check_update_of(&BlobMetadata::decode(&existing)?)?;

        metadata.version += 1;
        write_tx.insert(&self.records, key, metadata.encode()?);

        match write_tx.commit()? {
            Ok(()) => Ok(metadata),
            Err(_conflict) => Err(MetadataError::Conflict {
                blob_id: metadata.blob_id,
                expected: metadata.version - 1,
            }),
        }
    }

    async fn delete(&self, blob_id: &BlobId) -> Result<bool, MetadataError> {
        let key = blob_id.as_str().as_bytes();

        loop {
            let mut write_tx = self.database.write_tx()?;
            let existed = write_tx.contains_key(&self.records, key)?;
            write_tx.remove(&self.records, key);

            if write_tx.commit()?.is_ok() {
                return Ok(existed);
            }
            tracing::debug!(%blob_id, "metadata delete raced a writer, retrying");
        }
    }

    async fn metrics(&self) -> Result<MetadataMetrics, MetadataError> {
        let mut metrics = MetadataMetrics::default();
        self.scan(|metadata| metrics.record(&metadata));
        Ok(metrics)
    }

    async fn orphans(&self) -> Result<Vec<BlobId>, MetadataError> {
        let mut orphans = vec![];
        self.scan(|metadata| {
            if metadata.is_orphan() {
                orphans.push(metadata.blob_id);
            }
        });
        orphans.sort();
        Ok(orphans)
    }
}
