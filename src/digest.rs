//! Single-pass digesting and byte counting of content streams.

use core::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HashAlgorithm {
    #[default]
    Sha1 = 0,
    Blake3 = 1,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Blake3 => "blake3",
        }
    }

    /// Hex digest of an in-memory buffer.
    pub fn hex_digest(&self, data: &[u8]) -> String {
        let mut hasher = Hasher::new(*self);
        hasher.update(data);
        hasher.finalize_hex()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported digest algorithm {0:?}")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "blake3" => Ok(Self::Blake3),
            _ => Err(UnknownAlgorithm(s.into())),
        }
    }
}

enum Hasher {
    Sha1(Sha1),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(hasher) => hasher.update(data),
            Self::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(hasher) => base16ct::lower::encode_string(&hasher.finalize()),
            Self::Blake3(hasher) => base16ct::lower::encode_string(hasher.finalize().as_bytes()),
        }
    }
}

/// Size and digest of a fully consumed content stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetrics {
    pub size: u64,
    pub content_hash: String,
}

/// Wraps a reader, digesting and counting every byte that passes through.
pub struct MetricsReader<R> {
    inner: R,
    hasher: Hasher,
    size: u64,
}

impl<R> MetricsReader<R> {
    pub fn new(inner: R, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: Hasher::new(algorithm),
            size: 0,
        }
    }

    /// Bytes read so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> StreamMetrics {
        StreamMetrics {
            size: self.size,
            content_hash: self.hasher.finalize_hex(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MetricsReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let read = &buf.filled()[before..];
        this.hasher.update(read);
        this.size += read.len() as u64;

        Poll::Ready(Ok(()))
    }
}
