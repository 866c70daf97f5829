use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::available_parallelism;

use anyhow::Result;
use fileblob::BlobId;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal, Zipf};
use tokio::io::{AsyncRead, ReadBuf};

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    seed: u64,

    p50_size: u64,
    p99_size: u64,

    write_weight: u8,
    read_weight: u8,
    delete_weight: u8,
}

impl WorkloadBuilder {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    pub fn action_weights(mut self, writes: u8, reads: u8, deletes: u8) -> Self {
        self.write_weight = writes;
        self.read_weight = reads;
        self.delete_weight = deletes;
        self
    }

    pub fn build(self) -> Result<Workload> {
        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let action_distribution =
            WeightedIndex::new([self.write_weight, self.read_weight, self.delete_weight])?;

        Ok(Workload {
            name: self.name,
            concurrency: self.concurrency,
            p50_size: self.p50_size,
            p99_size: self.p99_size,

            rng,
            size_distribution,
            action_distribution,

            existing_blobs: Default::default(),
        })
    }
}

pub struct Workload {
    pub name: &'static str,
    pub concurrency: usize,
    pub p50_size: u64,
    pub p99_size: u64,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates payload sizes for the `write` action.
    size_distribution: LogNormal<f64>,
    /// A distribution that generates actions, such as write/read/delete.
    action_distribution: WeightedIndex<u8>,

    /// All the written blobs that we can then read or delete.
    existing_blobs: Vec<(PayloadSeed, BlobId)>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: available_parallelism().map_or(4, |n| n.get()),
            seed: rand::random(),

            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,

            write_weight: 33,
            read_weight: 33,
            delete_weight: 33,
        }
    }

    fn get_payload(&self, seed: PayloadSeed) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed.0);
        let len = self.size_distribution.sample(&mut rng) as u64;

        Payload { len, rng }
    }

    fn sample_readback(&mut self) -> Option<(PayloadSeed, BlobId)> {
        if self.existing_blobs.is_empty() {
            return None;
        }
        let len = self.existing_blobs.len();
        let zipf = Zipf::new(len as f64, 2.0).ok()?;
        // Recently written blobs are the most likely to be picked.
        let idx = len - self.rng.sample(zipf) as usize;

        Some(self.existing_blobs.remove(idx))
    }

    pub fn next_action(&mut self) -> Action {
        loop {
            match self.action_distribution.sample(&mut self.rng) {
                0 => {
                    let seed = PayloadSeed(self.rng.next_u64());
                    let payload = self.get_payload(seed);
                    return Action::Write(seed, payload);
                }
                1 => {
                    let Some((seed, blob_id)) = self.sample_readback() else {
                        continue;
                    };
                    let payload = self.get_payload(seed);
                    return Action::Read(seed, blob_id, payload);
                }
                _ => {
                    let Some((_seed, blob_id)) = self.sample_readback() else {
                        continue;
                    };
                    return Action::Delete(blob_id);
                }
            }
        }
    }

    /// Makes a blob available for reads or deletes.
    ///
    /// Has to be called once a write or read has completed.
    /// (Blobs currently being read will not be concurrently deleted)
    pub fn push_blob(&mut self, seed: PayloadSeed, blob_id: BlobId) {
        self.existing_blobs.push((seed, blob_id))
    }
}

/// Seed that regenerates the exact payload of a blob.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub struct PayloadSeed(u64);

pub enum Action {
    Write(PayloadSeed, Payload),
    Read(PayloadSeed, BlobId, Payload),
    Delete(BlobId),
}

/// Deterministic pseudo-random content of a fixed length.
pub struct Payload {
    pub len: u64,
    rng: SmallRng,
}

impl AsyncRead for Payload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let len_to_fill = (buf.remaining() as u64).min(self.len) as usize;

        let fill_buf = buf.initialize_unfilled_to(len_to_fill);
        self.rng.fill_bytes(fill_buf);
        buf.advance(len_to_fill);

        self.len -= len_to_fill as u64;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn lognormal_percentiles_work() {
        let workload = Workload::builder("test")
            .size_distribution(100, 1000)
            .build()
            .unwrap();

        let mut sizes: Vec<_> = (0..1000)
            .map(|seed| workload.get_payload(PayloadSeed(seed)).len)
            .collect();
        sizes.sort_unstable();

        let p50 = sizes[500];
        assert!((50..200).contains(&p50), "p50 was {p50}");
    }

    #[tokio::test]
    async fn payloads_are_reproducible() {
        let workload = Workload::builder("test").build().unwrap();

        let mut first = vec![];
        let mut payload = workload.get_payload(PayloadSeed(42));
        let len = payload.len;
        payload.read_to_end(&mut first).await.unwrap();

        let mut second = vec![];
        workload
            .get_payload(PayloadSeed(42))
            .read_to_end(&mut second)
            .await
            .unwrap();

        assert_eq!(first.len() as u64, len);
        assert_eq!(first, second);
    }
}
