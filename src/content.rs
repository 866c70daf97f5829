//! Moving blob content bytes to and from the filesystem.

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::digest::{HashAlgorithm, MetricsReader, StreamMetrics};

pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Raw content storage, addressed by path.
#[async_trait::async_trait]
pub trait ContentIo: Send + Sync + 'static {
    /// Streams `content` to `path` in a single pass, returning its size and digest.
    ///
    /// Parent directories are created as needed.
    async fn write(
        &self,
        path: &Path,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<StreamMetrics>;

    async fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Removes the file at `path`, returning whether it existed.
    async fn delete(&self, path: &Path) -> io::Result<bool>;

    /// Opens `path` for reading. Fails with [`io::ErrorKind::NotFound`] if it does not exist.
    async fn open_read(&self, path: &Path) -> io::Result<ContentReader>;
}

/// [`ContentIo`] on top of the local filesystem.
///
/// Content is first streamed into a temporary file next to its destination and
/// only renamed into place once it has been fully written and synced, so a
/// partially written blob is never visible under its final path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsContentIo {
    algorithm: HashAlgorithm,
}

impl FsContentIo {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

#[async_trait::async_trait]
impl ContentIo for FsContentIo {
    async fn write(
        &self,
        path: &Path,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<StreamMetrics> {
        let dir = path.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("content path {} has no parent", path.display()),
            )
        })?;
        tokio::fs::create_dir_all(dir).await?;

        let (file, temp_path) = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut reader = MetricsReader::new(content, self.algorithm);
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let target = path.to_owned();
        tokio::task::spawn_blocking(move || temp_path.persist(target))
            .await
            .map_err(io::Error::other)?
            .map_err(|err| err.error)?;

        Ok(reader.finish())
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        tokio::fs::try_exists(path).await
    }

    async fn delete(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn open_read(&self, path: &Path) -> io::Result<ContentReader> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }
}
