use std::path::{Path, PathBuf};

use crate::blob_id::BlobId;

/// Maps blob ids to content file locations below a store root.
///
/// The mapping must stay stable for the lifetime of a root: changing it on a
/// populated root makes existing content unreachable.
pub trait PathPolicy: Send + Sync + 'static {
    fn root(&self) -> &Path;

    fn for_content(&self, blob_id: &BlobId) -> PathBuf;
}

/// Shards content into `content/<xx>/<yy>/<id>.bytes`, where `xx` and `yy` are
/// the first two bytes of the BLAKE3 hash of the id.
///
/// That bounds any single directory to 256 subdirectories, with the blobs
/// spread evenly across the 65536 leaves no matter how ids are generated.
#[derive(Debug, Clone)]
pub struct HashingSubdirPolicy {
    root: PathBuf,
}

impl HashingSubdirPolicy {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathPolicy for HashingSubdirPolicy {
    fn root(&self) -> &Path {
        &self.root
    }

    fn for_content(&self, blob_id: &BlobId) -> PathBuf {
        let hash = blake3::hash(blob_id.as_str().as_bytes());
        let hash = hash.as_bytes();

        self.root
            .join("content")
            .join(base16ct::lower::encode_string(&hash[..1]))
            .join(base16ct::lower::encode_string(&hash[1..2]))
            .join(format!("{blob_id}.bytes"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::blob_id::{BlobIdGenerator, UuidBlobIdGenerator};

    #[test]
    fn test_paths_are_stable_and_sharded() {
        let policy = HashingSubdirPolicy::new("/srv/blobs");
        let id: BlobId = "0123456789abcdef".parse().unwrap();

        let path = policy.for_content(&id);
        assert_eq!(path, policy.for_content(&id));
        assert!(path.starts_with("/srv/blobs/content"));
        assert_eq!(path.file_name().unwrap(), "0123456789abcdef.bytes");

        let shard = path.strip_prefix("/srv/blobs/content").unwrap();
        assert_eq!(shard.components().count(), 3);
    }

    #[test]
    fn test_ids_spread_over_shards() {
        let policy = HashingSubdirPolicy::new("root");
        let generator = UuidBlobIdGenerator;

        let top_level: HashSet<_> = (0..2000)
            .map(|_| {
                let path = policy.for_content(&generator.create_blob_id());
                path.components().nth(2).unwrap().as_os_str().to_owned()
            })
            .collect();

        // 2000 ids over 256 buckets should touch nearly all of them.
        assert!(top_level.len() > 200, "only {} shards used", top_level.len());
    }
}
