use crate::blob_id::BlobId;
use crate::blobstore::Blob;

/// Observer of blob lifecycle events.
///
/// Notifications are delivered synchronously from within the triggering call.
/// An error returned here aborts that call and is handed to its caller as
/// [`BlobStoreError::Listener`](crate::BlobStoreError::Listener).
pub trait BlobStoreListener: Send + Sync {
    fn on_created(&self, _blob: &Blob, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_accessed(&self, _blob: &Blob, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_deleted(&self, _blob_id: &BlobId, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
