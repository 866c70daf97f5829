use std::collections::HashMap;

use parking_lot::RwLock;

use super::*;

/// Keeps all records in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<HashMap<BlobId, BlobMetadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn add(&self, metadata: &BlobMetadata) -> Result<(), MetadataError> {
        let mut records = self.records.write();
        if records.contains_key(&metadata.blob_id) {
            return Err(MetadataError::Duplicate(metadata.blob_id.clone()));
        }

        let mut record = metadata.clone();
        record.version = 0;
        records.insert(record.blob_id.clone(), record);
        Ok(())
    }

    async fn get(&self, blob_id: &BlobId) -> Result<Option<BlobMetadata>, MetadataError> {
        Ok(self.records.read().get(blob_id).cloned())
    }

    async fn update(&self, mut metadata: BlobMetadata) -> Result<BlobMetadata, MetadataError> {
        let mut records = self.records.write();
        let Some(existing) = records.get_mut(&metadata.blob_id) else {
            return Err(MetadataError::NotFound(metadata.blob_id));
        };
        metadata.check_update_of(existing)?;

        metadata.version += 1;
        *existing = metadata.clone();
        Ok(metadata)
    }

    async fn delete(&self, blob_id: &BlobId) -> Result<bool, MetadataError> {
        Ok(self.records.write().remove(blob_id).is_some())
    }

    async fn metrics(&self) -> Result<MetadataMetrics, MetadataError> {
        let records = self.records.read();
        let mut metrics = MetadataMetrics::default();
        for metadata in records.values() {
            metrics.record(metadata);
        }
        Ok(metrics)
    }

    async fn orphans(&self) -> Result<Vec<BlobId>, MetadataError> {
        let mut orphans: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|metadata| metadata.is_orphan())
            .map(|metadata| metadata.blob_id.clone())
            .collect();
        orphans.sort();
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::test_support;

    #[tokio::test]
    async fn test_lifecycle() {
        test_support::check_lifecycle(&MemoryMetadataStore::new()).await;
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        test_support::check_stale_update_conflicts(&MemoryMetadataStore::new()).await;
    }

    #[tokio::test]
    async fn test_headers_are_immutable() {
        test_support::check_headers_immutable(&MemoryMetadataStore::new()).await;
    }
}
