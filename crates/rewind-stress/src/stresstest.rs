use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::backend::Backend;
use crate::caches::DebuggerCaches;
use crate::config::Config;
use crate::workloads::{WorkloadsConfig, process_payload};

struct WorkloadStats {
    concurrency: usize,
    durations: DDSketch,
    failures: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let backend = Arc::new(Backend::new(config.backend.clone()));
    let caches = Arc::new(DebuggerCaches::new(&config.caches, backend));

    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| (workload.concurrency.max(1), Arc::new(workload.payload)))
        .collect();

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, payload)| {
            let caches = Arc::clone(&caches);
            let payload = Arc::clone(payload);
            tokio::spawn(async move {
                if let Err(error) = process_payload(&caches, &payload).await {
                    tracing::warn!(%error, "warmup operation failed");
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, payload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let caches = Arc::clone(&caches);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let payload = Arc::clone(&payload);
                        let caches = Arc::clone(&caches);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if process_payload(&caches, &payload).await.is_err() {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            task_durations
                                .lock()
                                .unwrap_or_else(|poison| poison.into_inner())
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let durations: DDSketch = {
                let mut task_durations = task_durations
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner());
                std::mem::take(&mut *task_durations)
            };

            WorkloadStats {
                concurrency,
                durations,
                failures: failures.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let WorkloadStats {
            concurrency,
            durations,
            failures,
        } = task.context("workload panicked")?;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let calls = caches.backend.calls();
    println!();
    println!(
        "Backend calls: {} object previews, {} message ranges, {} annotation streams",
        calls.objects, calls.messages, calls.annotations
    );

    Ok(())
}
