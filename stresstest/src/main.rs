use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fileblob::{BlobStoreConfig, MetadataBackend};
use tracing_subscriber::EnvFilter;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod stresstest;
mod workload;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let root = tempfile::tempdir()?;
    let mut config = BlobStoreConfig::new("stresstest", root.path());
    config.metadata = MetadataBackend::Fjall { path: None };
    let store = Arc::new(config.open().await?);

    let workloads = vec![
        Workload::builder("small blobs")
            .concurrency(32)
            .size_distribution(16 * 1024, 1024 * 1024) // p50 = 16K, p99 = 1M
            .action_weights(70, 25, 5)
            .build()?,
        Workload::builder("large blobs")
            .concurrency(4)
            .size_distribution(1024 * 1024, 16 * 1024 * 1024)
            .action_weights(50, 30, 20)
            .build()?,
    ];

    perform_stresstest(store, workloads, Duration::from_secs(2)).await
}
