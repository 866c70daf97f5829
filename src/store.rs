//! The filesystem backed [`BlobStore`].

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncRead;

use crate::audit::{AuditAction, AuditEntry, AuditStore};
use crate::blob_id::{BlobId, BlobIdGenerator};
use crate::blobstore::{Blob, BlobStore, BlobStoreMetrics, AUDIT_INFO_HEADER, BLOB_NAME_HEADER};
use crate::content::ContentIo;
use crate::error::{BlobStoreError, Result};
use crate::listener::BlobStoreListener;
use crate::metadata::{BlobMetadata, BlobMetrics, Headers, MetadataError, MetadataStore};
use crate::paths::PathPolicy;

const REQUIRED_HEADERS: [&str; 2] = [BLOB_NAME_HEADER, AUDIT_INFO_HEADER];

/// Upper bound on re-reads when a soft delete loses a race on the metadata record.
const SOFT_DELETE_ATTEMPTS: usize = 8;

/// Stores blob content as files below a root directory, with bookkeeping in a
/// separate [`MetadataStore`].
///
/// Every write follows the same protocol: a metadata record marked for
/// deletion is added first, the content is streamed to disk, and only then
/// is the record updated with the content metrics and unmarked. A write that
/// fails in between leaves the marked record behind as an orphan, which
/// [`FileBlobStore::orphans`] reports.
///
/// Concurrent updates to the same record are resolved through the metadata
/// store's version check.
pub struct FileBlobStore {
    name: Arc<str>,
    ids: Arc<dyn BlobIdGenerator>,
    paths: Arc<dyn PathPolicy>,
    files: Arc<dyn ContentIo>,
    metadata: Arc<dyn MetadataStore>,
    audit: Option<Arc<dyn AuditStore>>,
    listener: RwLock<Option<Arc<dyn BlobStoreListener>>>,
}

impl FileBlobStore {
    pub fn new(
        name: impl Into<String>,
        ids: Arc<dyn BlobIdGenerator>,
        paths: Arc<dyn PathPolicy>,
        files: Arc<dyn ContentIo>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            name: name.into().into(),
            ids,
            paths,
            files,
            metadata,
            audit: None,
            listener: RwLock::new(None),
        }
    }

    pub fn with_audit_store(mut self, audit: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Ids of blobs whose initial write never completed.
    pub async fn orphans(&self) -> Result<Vec<BlobId>> {
        self.metadata
            .orphans()
            .await
            .map_err(|source| BlobStoreError::MetadataScan {
                store: self.name.to_string(),
                source,
            })
    }

    fn metadata_error(&self, blob_id: &BlobId, source: MetadataError) -> BlobStoreError {
        BlobStoreError::Metadata {
            store: self.name.to_string(),
            blob_id: blob_id.clone(),
            source,
        }
    }

    fn io_error(&self, blob_id: &BlobId, source: std::io::Error) -> BlobStoreError {
        BlobStoreError::Io {
            store: self.name.to_string(),
            blob_id: blob_id.clone(),
            source,
        }
    }

    fn blob(&self, metadata: &BlobMetadata, metrics: BlobMetrics, content_path: PathBuf) -> Blob {
        Blob {
            id: metadata.blob_id.clone(),
            headers: metadata.headers.clone(),
            metrics,
            store_name: Arc::clone(&self.name),
            content_path,
            files: Arc::clone(&self.files),
        }
    }

    fn notify(
        &self,
        blob_id: &BlobId,
        event: impl FnOnce(&dyn BlobStoreListener) -> anyhow::Result<()>,
    ) -> Result<()> {
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => {
                event(listener.as_ref()).map_err(|error| BlobStoreError::Listener {
                    store: self.name.to_string(),
                    blob_id: blob_id.clone(),
                    error,
                })
            }
            None => Ok(()),
        }
    }

    async fn audit(&self, action: AuditAction, metadata: &BlobMetadata) -> Result<()> {
        let Some(audit) = &self.audit else {
            return Ok(());
        };
        let entry = AuditEntry::new(&self.name, action, metadata);
        audit.add(entry).await.map_err(|error| BlobStoreError::Audit {
            store: self.name.to_string(),
            blob_id: metadata.blob_id.clone(),
            error,
        })
    }
}

#[async_trait::async_trait]
impl BlobStore for FileBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create<R>(&self, mut content: R, headers: Headers) -> Result<Blob>
    where
        R: AsyncRead + Send + Unpin,
    {
        for header in REQUIRED_HEADERS {
            if !headers.contains_key(header) {
                return Err(BlobStoreError::MissingHeader(header));
            }
        }

        let blob_id = self.ids.create_blob_id();
        let path = self.paths.for_content(&blob_id);

        let pending = BlobMetadata::new(blob_id.clone(), headers);
        self.metadata
            .add(&pending)
            .await
            .map_err(|err| self.metadata_error(&blob_id, err))?;

        tracing::debug!(%blob_id, path = %path.display(), "writing blob");

        // On failure the pending record stays behind as an orphan.
        let stream_metrics = self
            .files
            .write(&path, &mut content)
            .await
            .map_err(|err| self.io_error(&blob_id, err))?;

        let metrics = BlobMetrics {
            creation_time: Utc::now().trunc_subsecs(3),
            content_hash: stream_metrics.content_hash,
            content_size: stream_metrics.size,
        };

        let mut live = pending;
        live.metrics = Some(metrics.clone());
        live.marked_for_deletion = false;
        let live = self
            .metadata
            .update(live)
            .await
            .map_err(|err| self.metadata_error(&blob_id, err))?;

        let blob = self.blob(&live, metrics, path);
        self.notify(&blob_id, |listener| {
            let message = format!("Blob {blob_id} written to {}", blob.content_path.display());
            listener.on_created(&blob, &message)
        })?;
        self.audit(AuditAction::Create, &live).await?;

        Ok(blob)
    }

    async fn get(&self, blob_id: &BlobId) -> Result<Option<Blob>> {
        let metadata = self
            .metadata
            .get(blob_id)
            .await
            .map_err(|err| self.metadata_error(blob_id, err))?;

        let Some(metadata) = metadata else {
            tracing::debug!(%blob_id, "attempt to access non-existent blob");
            return Ok(None);
        };
        if metadata.marked_for_deletion {
            tracing::debug!(%blob_id, "attempt to access blob marked for deletion");
            return Ok(None);
        }

        let path = self.paths.for_content(blob_id);
        let content_exists = self
            .files
            .exists(&path)
            .await
            .map_err(|err| self.io_error(blob_id, err))?;

        let metrics = match metadata.metrics.clone() {
            Some(metrics) if content_exists => metrics,
            _ => {
                tracing::error!(
                    %blob_id,
                    path = %path.display(),
                    "blob content not found at expected location"
                );
                return Err(BlobStoreError::Inconsistent {
                    store: self.name.to_string(),
                    blob_id: blob_id.clone(),
                    path,
                });
            }
        };

        tracing::debug!(%blob_id, "accessing blob");
        let blob = self.blob(&metadata, metrics, path);
        self.notify(blob_id, |listener| listener.on_accessed(&blob, ""))?;

        Ok(Some(blob))
    }

    async fn delete(&self, blob_id: &BlobId) -> Result<bool> {
        let mut last_conflict = None;

        for _ in 0..SOFT_DELETE_ATTEMPTS {
            let metadata = self
                .metadata
                .get(blob_id)
                .await
                .map_err(|err| self.metadata_error(blob_id, err))?;

            let Some(mut metadata) = metadata else {
                tracing::debug!(%blob_id, "attempt to mark-for-delete non-existent blob");
                return Ok(false);
            };
            if metadata.marked_for_deletion {
                tracing::debug!(%blob_id, "attempt to mark-for-delete blob already marked for deletion");
                return Ok(false);
            }

            metadata.marked_for_deletion = true;
            match self.metadata.update(metadata).await {
                Ok(metadata) => {
                    self.audit(AuditAction::DeleteRequest, &metadata).await?;
                    return Ok(true);
                }
                Err(err @ MetadataError::Conflict { .. }) => {
                    tracing::debug!(%blob_id, "metadata changed during mark-for-delete, retrying");
                    last_conflict = Some(err);
                }
                Err(MetadataError::NotFound(_)) => {
                    tracing::debug!(%blob_id, "blob was hard-deleted during mark-for-delete");
                    return Ok(false);
                }
                Err(err) => return Err(self.metadata_error(blob_id, err)),
            }
        }

        let err = last_conflict.unwrap_or(MetadataError::Conflict {
            blob_id: blob_id.clone(),
            expected: 0,
        });
        Err(self.metadata_error(blob_id, err))
    }

    async fn delete_hard(&self, blob_id: &BlobId) -> Result<bool> {
        let metadata = self
            .metadata
            .get(blob_id)
            .await
            .map_err(|err| self.metadata_error(blob_id, err))?;

        let Some(metadata) = metadata else {
            tracing::debug!(%blob_id, "attempt to delete-hard non-existent blob");
            return Ok(false);
        };

        let path = self.paths.for_content(blob_id);
        let content_deleted = self
            .files
            .delete(&path)
            .await
            .map_err(|err| self.io_error(blob_id, err))?;
        if !content_deleted {
            tracing::error!(%blob_id, path = %path.display(), "deleting blob: content file was missing");
        }

        tracing::debug!(%blob_id, "deleting-hard blob");
        self.notify(blob_id, |listener| {
            listener.on_deleted(blob_id, &format!("Path:{}", path.display()))
        })?;

        self.metadata
            .delete(blob_id)
            .await
            .map_err(|err| self.metadata_error(blob_id, err))?;
        self.audit(AuditAction::Purge, &metadata).await?;

        Ok(content_deleted)
    }

    async fn metrics(&self) -> Result<BlobStoreMetrics> {
        let aggregate =
            self.metadata
                .metrics()
                .await
                .map_err(|source| BlobStoreError::MetadataScan {
                    store: self.name.to_string(),
                    source,
                })?;

        let available_space =
            fs2::available_space(self.paths.root()).map_err(|source| BlobStoreError::Volume {
                store: self.name.to_string(),
                source,
            })?;

        Ok(BlobStoreMetrics {
            blob_count: aggregate.blob_count,
            total_size: aggregate.total_size,
            available_space,
        })
    }

    fn set_listener(&self, listener: Option<Arc<dyn BlobStoreListener>>) {
        *self.listener.write() = listener;
    }

    fn listener(&self) -> Option<Arc<dyn BlobStoreListener>> {
        self.listener.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::content::ContentReader;
    use crate::digest::{HashAlgorithm, StreamMetrics};
    use crate::metadata::{MemoryMetadataStore, MetadataMetrics};
    use crate::paths::HashingSubdirPolicy;

    struct FixedIds(Vec<&'static str>, Mutex<usize>);

    impl BlobIdGenerator for FixedIds {
        fn create_blob_id(&self) -> BlobId {
            let mut next = self.1.lock();
            let id = self.0[*next % self.0.len()];
            *next += 1;
            id.parse().unwrap()
        }
    }

    #[derive(Default)]
    struct MemoryFiles {
        files: Mutex<HashMap<PathBuf, Vec<u8>>>,
        fail_writes: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ContentIo for MemoryFiles {
        async fn write(
            &self,
            path: &Path,
            content: &mut (dyn AsyncRead + Send + Unpin),
        ) -> io::Result<StreamMetrics> {
            let mut data = vec![];
            content.read_to_end(&mut data).await?;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::other("disk full"));
            }
            let metrics = StreamMetrics {
                size: data.len() as u64,
                content_hash: HashAlgorithm::Sha1.hex_digest(&data),
            };
            self.files.lock().insert(path.to_owned(), data);
            Ok(metrics)
        }

        async fn exists(&self, path: &Path) -> io::Result<bool> {
            Ok(self.files.lock().contains_key(path))
        }

        async fn delete(&self, path: &Path) -> io::Result<bool> {
            Ok(self.files.lock().remove(path).is_some())
        }

        async fn open_read(&self, path: &Path) -> io::Result<ContentReader> {
            match self.files.lock().get(path) {
                Some(data) => Ok(Box::new(io::Cursor::new(data.clone()))),
                None => Err(io::ErrorKind::NotFound.into()),
            }
        }
    }

    /// Fails the first `update` with a version conflict.
    struct ConflictOnce {
        inner: MemoryMetadataStore,
        tripped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl MetadataStore for ConflictOnce {
        async fn add(&self, metadata: &BlobMetadata) -> std::result::Result<(), MetadataError> {
            self.inner.add(metadata).await
        }

        async fn get(
            &self,
            blob_id: &BlobId,
        ) -> std::result::Result<Option<BlobMetadata>, MetadataError> {
            self.inner.get(blob_id).await
        }

        async fn update(
            &self,
            metadata: BlobMetadata,
        ) -> std::result::Result<BlobMetadata, MetadataError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(MetadataError::Conflict {
                    blob_id: metadata.blob_id,
                    expected: metadata.version,
                });
            }
            self.inner.update(metadata).await
        }

        async fn delete(&self, blob_id: &BlobId) -> std::result::Result<bool, MetadataError> {
            self.inner.delete(blob_id).await
        }

        async fn metrics(&self) -> std::result::Result<MetadataMetrics, MetadataError> {
            self.inner.metrics().await
        }

        async fn orphans(&self) -> std::result::Result<Vec<BlobId>, MetadataError> {
            self.inner.orphans().await
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
        fail: bool,
    }

    impl BlobStoreListener for RecordingListener {
        fn on_created(&self, blob: &Blob, message: &str) -> anyhow::Result<()> {
            self.events.lock().push(format!("created {} ({message})", blob.id()));
            if self.fail {
                anyhow::bail!("indexer unavailable");
            }
            Ok(())
        }

        fn on_accessed(&self, blob: &Blob, _message: &str) -> anyhow::Result<()> {
            self.events.lock().push(format!("accessed {}", blob.id()));
            Ok(())
        }

        fn on_deleted(&self, blob_id: &BlobId, _message: &str) -> anyhow::Result<()> {
            self.events.lock().push(format!("deleted {blob_id}"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAudit(Mutex<Vec<AuditEntry>>);

    #[async_trait::async_trait]
    impl AuditStore for RecordingAudit {
        async fn add(&self, entry: AuditEntry) -> anyhow::Result<()> {
            self.0.lock().push(entry);
            Ok(())
        }
    }

    fn headers() -> Headers {
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.into(), "my blob".into());
        headers.insert(AUDIT_INFO_HEADER.into(), "John did this".into());
        headers
    }

    fn store_with(
        ids: Vec<&'static str>,
        files: Arc<MemoryFiles>,
        metadata: Arc<dyn MetadataStore>,
    ) -> FileBlobStore {
        FileBlobStore::new(
            "testStore",
            Arc::new(FixedIds(ids, Mutex::new(0))),
            Arc::new(HashingSubdirPolicy::new("/blobs")),
            files,
            metadata,
        )
    }

    fn store() -> (FileBlobStore, Arc<MemoryFiles>) {
        let files = Arc::new(MemoryFiles::default());
        let metadata = Arc::new(MemoryMetadataStore::new());
        (store_with(vec!["testId"], files.clone(), metadata), files)
    }

    #[tokio::test]
    async fn test_create_requires_headers() {
        let (store, files) = store();

        let mut partial = headers();
        partial.remove(AUDIT_INFO_HEADER);
        let err = store.create(&[0u8; 100][..], partial).await.unwrap_err();
        assert!(matches!(err, BlobStoreError::MissingHeader(AUDIT_INFO_HEADER)));

        let err = store.create(&[0u8; 100][..], Headers::new()).await.unwrap_err();
        assert!(matches!(err, BlobStoreError::MissingHeader(BLOB_NAME_HEADER)));

        assert!(files.files.lock().is_empty());
        assert_eq!(
            store.metadata.metrics().await.unwrap(),
            MetadataMetrics::default()
        );
    }

    #[tokio::test]
    async fn test_successful_creation() {
        let (store, _files) = store();
        let before = Utc::now().trunc_subsecs(3);

        let blob = store.create(&[7u8; 200][..], headers()).await.unwrap();

        assert_eq!(blob.id().as_str(), "testId");
        assert_eq!(blob.blob_name(), Some("my blob"));
        let metrics = blob.metrics();
        assert_eq!(metrics.content_size, 200);
        assert_eq!(metrics.content_hash, HashAlgorithm::Sha1.hex_digest(&[7u8; 200]));
        assert!(metrics.creation_time >= before);
        assert!(metrics.creation_time <= Utc::now());

        let stored = store.metadata.get(blob.id()).await.unwrap().unwrap();
        assert!(!stored.marked_for_deletion);
        assert_eq!(stored.metrics.as_ref(), Some(metrics));
        assert_eq!(stored.version, 1);

        assert_eq!(blob.read_to_vec().await.unwrap(), vec![7u8; 200]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_orphan() {
        let (store, files) = store();
        files.fail_writes.store(true, Ordering::SeqCst);

        let err = store.create(&b"doomed"[..], headers()).await.unwrap_err();
        match err {
            BlobStoreError::Io { store, blob_id, .. } => {
                assert_eq!(store, "testStore");
                assert_eq!(blob_id.as_str(), "testId");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let id: BlobId = "testId".parse().unwrap();
        assert_eq!(store.orphans().await.unwrap(), vec![id.clone()]);
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap());

        // An orphan has no content, so purging reports nothing deleted.
        assert!(!store.delete_hard(&id).await.unwrap());
        assert!(store.orphans().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_fatal() {
        let files = Arc::new(MemoryFiles::default());
        let store = store_with(
            vec!["same"],
            files.clone(),
            Arc::new(MemoryMetadataStore::new()),
        );

        let first = store.create(&b"first"[..], headers()).await.unwrap();
        let err = store.create(&b"second"[..], headers()).await.unwrap_err();
        assert!(matches!(
            err,
            BlobStoreError::Metadata {
                source: MetadataError::Duplicate(_),
                ..
            }
        ));

        // The original content is untouched.
        assert_eq!(first.read_to_vec().await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_missing_content_is_inconsistent() {
        let (store, files) = store();
        let blob = store.create(&b"data"[..], headers()).await.unwrap();

        files.files.lock().clear();

        match store.get(blob.id()).await {
            Err(BlobStoreError::Inconsistent { blob_id, path, .. }) => {
                assert_eq!(&blob_id, blob.id());
                assert_eq!(path, blob.content_path());
            }
            other => panic!("expected an inconsistency, got {other:?}"),
        }

        assert!(matches!(
            blob.open().await,
            Err(BlobStoreError::ContentGone { .. })
        ));

        // Hard delete still cleans up, reporting the missing content.
        assert!(!store.delete_hard(blob.id()).await.unwrap());
        assert!(store.get(blob.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listener_sees_lifecycle() {
        let (store, _files) = store();
        let listener = Arc::new(RecordingListener::default());
        store.set_listener(Some(listener.clone()));
        assert!(store.listener().is_some());

        let blob = store.create(&b"data"[..], headers()).await.unwrap();
        store.get(blob.id()).await.unwrap().unwrap();
        store.delete(blob.id()).await.unwrap();
        store.delete_hard(blob.id()).await.unwrap();

        let path = blob.content_path().display().to_string();
        assert_eq!(
            *listener.events.lock(),
            vec![
                format!("created testId (Blob testId written to {path})"),
                "accessed testId".to_string(),
                "deleted testId".to_string(),
            ]
        );

        store.set_listener(None);
        assert!(store.listener().is_none());
    }

    #[tokio::test]
    async fn test_listener_failure_propagates() {
        let (store, _files) = store();
        store.set_listener(Some(Arc::new(RecordingListener {
            fail: true,
            ..Default::default()
        })));

        let err = store.create(&b"data"[..], headers()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "blob store 'testStore': listener failed on blob testId: indexer unavailable"
        );
        let BlobStoreError::Listener { blob_id, .. } = &err else {
            panic!("expected a listener error, got {err:?}");
        };

        // The blob was created regardless and can be cleaned up by id.
        let stored = store.metadata.get(blob_id).await.unwrap().unwrap();
        assert!(!stored.marked_for_deletion);
        store.set_listener(None);
        assert!(store.delete_hard(blob_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_audit_failure_names_the_blob() {
        struct BrokenAudit;

        #[async_trait::async_trait]
        impl AuditStore for BrokenAudit {
            async fn add(&self, _entry: AuditEntry) -> anyhow::Result<()> {
                anyhow::bail!("audit log is read-only")
            }
        }

        let (store, _files) = store();
        let store = store.with_audit_store(Arc::new(BrokenAudit));

        let err = store.create(&b"data"[..], headers()).await.unwrap_err();
        match &err {
            BlobStoreError::Audit { store, blob_id, .. } => {
                assert_eq!(store, "testStore");
                assert_eq!(blob_id.as_str(), "testId");
            }
            other => panic!("expected an audit error, got {other:?}"),
        }
        assert!(err.to_string().ends_with("audit log is read-only"));

        let id: BlobId = "testId".parse().unwrap();
        assert!(store.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_soft_delete_retries_on_conflict() {
        let files = Arc::new(MemoryFiles::default());
        let metadata = Arc::new(ConflictOnce {
            inner: MemoryMetadataStore::new(),
            tripped: AtomicBool::new(true),
        });
        let store = store_with(vec!["contested"], files, metadata.clone());

        let blob = store.create(&b"data"[..], headers()).await.unwrap();

        metadata.tripped.store(false, Ordering::SeqCst);
        assert!(store.delete(blob.id()).await.unwrap());
        assert!(store.get(blob.id()).await.unwrap().is_none());

        let stored = metadata.get(blob.id()).await.unwrap().unwrap();
        assert!(stored.marked_for_deletion);
        assert!(stored.metrics.is_some());
    }

    #[tokio::test]
    async fn test_audit_trail() {
        let (store, _files) = store();
        let audit = Arc::new(RecordingAudit::default());
        let store = store.with_audit_store(audit.clone());

        let blob = store.create(&b"data"[..], headers()).await.unwrap();
        assert!(store.delete(blob.id()).await.unwrap());
        assert!(!store.delete(blob.id()).await.unwrap());
        assert!(store.delete_hard(blob.id()).await.unwrap());

        let entries = audit.0.lock();
        let actions: Vec<_> = entries.iter().map(|entry| entry.action).collect();
        assert_eq!(
            actions,
            [AuditAction::Create, AuditAction::DeleteRequest, AuditAction::Purge]
        );
        for entry in entries.iter() {
            assert_eq!(entry.store_name, "testStore");
            assert_eq!(entry.blob_id.as_str(), "testId");
            assert_eq!(entry.blob_name, "my blob");
            assert_eq!(entry.principal, "John did this");
        }
    }
}
