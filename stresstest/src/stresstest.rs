use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytesize::ByteSize;
use fileblob::{BlobStore, FileBlobStore, Headers, AUDIT_INFO_HEADER, BLOB_NAME_HEADER};
use sketches_ddsketch::DDSketch;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use crate::workload::{Action, Payload, PayloadSeed, Workload};

pub async fn perform_stresstest(
    store: Arc<FileBlobStore>,
    workloads: Vec<Workload>,
    duration: Duration,
) -> Result<()> {
    // run the workloads concurrently
    let tasks: Vec<_> = workloads
        .into_iter()
        .map(|workload| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let concurrency = workload.concurrency;
                let semaphore = Arc::new(Semaphore::new(concurrency));
                let deadline = tokio::time::Instant::now() + duration;

                let workload = Arc::new(Mutex::new(workload));

                let task_durations = Arc::new(Mutex::new(DDSketch::default()));
                let failures = Arc::new(AtomicU64::new(0));

                // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
                let sleep = tokio::time::sleep_until(deadline);
                tokio::pin!(sleep);

                loop {
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => {
                            let permit = permit?;
                            let workload = Arc::clone(&workload);
                            let store = Arc::clone(&store);
                            let task_durations = Arc::clone(&task_durations);
                            let failures = Arc::clone(&failures);

                            tokio::spawn(async move {
                                let task_start = Instant::now();
                                let action = lock(&workload).next_action();
                                if let Err(err) = run_action(&store, &workload, action).await {
                                    tracing::error!("stresstest action failed: {err:#}");
                                    failures.fetch_add(1, Ordering::Relaxed);
                                }
                                lock(&task_durations).add(task_start.elapsed().as_secs_f64());

                                drop(permit);
                            });
                        }
                        _ = &mut sleep => {
                            break;
                        }
                    }
                }

                // by acquiring *all* the permits, we essentially wait for all outstanding tasks to finish
                let _permits = semaphore.acquire_many(concurrency as u32).await?;

                let task_durations = std::mem::take(&mut *lock(&task_durations));
                let workload = match Arc::try_unwrap(workload) {
                    Ok(workload) => workload.into_inner().unwrap_or_else(|err| err.into_inner()),
                    Err(_) => bail!("workload is still shared after all tasks finished"),
                };
                anyhow::Ok((workload, task_durations, failures.load(Ordering::Relaxed)))
            })
        })
        .collect();

    let finished_tasks = futures::future::join_all(tasks).await;

    let mut total_failures = 0;
    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, task_durations, failures) = task??;
        total_failures += failures;

        let concurrency = workload.concurrency;
        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("# Workload {i}: {} (concurrency: {concurrency})", workload.name);
        println!(
            "  blob sizes {}-{}",
            ByteSize::b(workload.p50_size),
            ByteSize::b(workload.p99_size)
        );
        println!("=> {ops} operations, {ops_ps:.2} ops/s, {failures} failures");

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let metrics = store.metrics().await?;
    println!(
        "# Store '{}': {} blobs, {} stored, {} available",
        store.name(),
        metrics.blob_count,
        ByteSize::b(metrics.total_size),
        ByteSize::b(metrics.available_space)
    );
    let orphans = store.orphans().await?;
    if !orphans.is_empty() {
        println!("  {} orphaned records", orphans.len());
    }

    if total_failures > 0 {
        bail!("{total_failures} stresstest actions failed");
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

fn headers(seed: PayloadSeed) -> Headers {
    let mut headers = Headers::new();
    headers.insert(BLOB_NAME_HEADER.into(), format!("stresstest/{seed:?}.bin"));
    headers.insert(AUDIT_INFO_HEADER.into(), "stresstest".into());
    headers
}

async fn run_action(
    store: &FileBlobStore,
    workload: &Mutex<Workload>,
    action: Action,
) -> Result<()> {
    match action {
        Action::Write(seed, payload) => {
            let blob = store.create(payload, headers(seed)).await?;
            lock(workload).push_blob(seed, blob.id().clone());
        }
        Action::Read(seed, blob_id, payload) => {
            let blob = store
                .get(&blob_id)
                .await?
                .with_context(|| format!("blob {blob_id} disappeared"))?;
            let actual = blob.read_to_vec().await?;
            if actual != read_payload(payload).await? {
                bail!("blob {blob_id} does not match its payload");
            }
            lock(workload).push_blob(seed, blob_id);
        }
        Action::Delete(blob_id) => {
            store.delete(&blob_id).await?;
            store.delete_hard(&blob_id).await?;
        }
    }
    Ok(())
}

async fn read_payload(mut payload: Payload) -> Result<Vec<u8>> {
    let mut expected = Vec::with_capacity(payload.len as usize);
    payload.read_to_end(&mut expected).await?;
    Ok(expected)
}
