use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const MAX_ID_LEN: usize = 128;

/// The opaque, immutable identifier of a blob.
///
/// Ids are assigned once by a [`BlobIdGenerator`] and are never reused. They
/// only ever contain ASCII alphanumerics, `-` and `_`, which keeps them safe
/// to use as file names. Deserialization applies the same check.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid blob id {0:?}")]
pub struct InvalidBlobId(pub String);

fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl TryFrom<String> for BlobId {
    type Error = InvalidBlobId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if is_valid_id(&s) {
            Ok(Self(s))
        } else {
            Err(InvalidBlobId(s))
        }
    }
}

impl FromStr for BlobId {
    type Err = InvalidBlobId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.0
    }
}

/// Hands out fresh [`BlobId`]s.
///
/// Implementations must never return the same id twice, including across
/// concurrent callers.
pub trait BlobIdGenerator: Send + Sync {
    fn create_blob_id(&self) -> BlobId;
}

/// Random v4 UUIDs in their 32 character hex form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidBlobIdGenerator;

impl BlobIdGenerator for UuidBlobIdGenerator {
    fn create_blob_id(&self) -> BlobId {
        BlobId(uuid::Uuid::new_v4().simple().to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_generated_ids_are_distinct_and_valid() {
        let generator = UuidBlobIdGenerator;
        let ids: HashSet<_> = (0..1000).map(|_| generator.create_blob_id()).collect();
        assert_eq!(ids.len(), 1000);

        for id in ids {
            assert_eq!(id.as_str().parse::<BlobId>().unwrap(), id);
        }
    }

    #[test]
    fn test_rejects_unsafe_ids() {
        assert!("".parse::<BlobId>().is_err());
        assert!("../etc/passwd".parse::<BlobId>().is_err());
        assert!("a/b".parse::<BlobId>().is_err());
        assert!("x".repeat(MAX_ID_LEN + 1).parse::<BlobId>().is_err());

        let id: BlobId = "some_blob-01".parse().unwrap();
        assert_eq!(id.to_string(), "some_blob-01");
        assert_eq!(format!("{id:?}"), "BlobId(some_blob-01)");
    }

    #[test]
    fn test_decoding_validates_ids() {
        let id: BlobId = "stored-id_1".parse().unwrap();
        let bytes = postcard::to_stdvec(&id).unwrap();
        assert_eq!(bytes, postcard::to_stdvec("stored-id_1").unwrap());
        assert_eq!(postcard::from_bytes::<BlobId>(&bytes).unwrap(), id);

        let bytes = postcard::to_stdvec("../../etc/passwd").unwrap();
        assert!(postcard::from_bytes::<BlobId>(&bytes).is_err());
        let bytes = postcard::to_stdvec("").unwrap();
        assert!(postcard::from_bytes::<BlobId>(&bytes).is_err());
    }
}
