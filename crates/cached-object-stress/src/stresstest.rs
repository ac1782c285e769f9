use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_workload};

pub async fn perform_stresstest(workloads: WorkloadsConfig, duration: Duration) -> Result<()> {
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| Arc::new(prepare_workload(workload)))
        .collect();

    // warmup: initialize every object and its derivation
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                workload.object.initialize(None).await?;
                workload.doubled.initialize(None).await?;
                anyhow::Ok(())
            })
        });

        for result in futures::future::join_all(futures).await {
            result??;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(Mutex::new(0usize));
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
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if let Err(err) = process_workload(&workload).await {
                                tracing::debug!(error = %err, "Operation failed");
                                *failures.lock().unwrap() += 1;
                            }
                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };
            let failures = *failures.lock().unwrap();

            (task_durations, failures)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for ((i, task), workload) in finished_tasks.into_iter().enumerate().zip(&workloads) {
        let (task_durations, failures) = task?;
        let concurrency = workload.concurrency;
        let operation = workload.operation;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} ({operation:?}, concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );

        if ops > 0 {
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
            let quantile = |q| {
                Duration::from_secs_f64(task_durations.quantile(q).ok().flatten().unwrap_or_default())
            };
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let (value, version) = workload.object.versioned_value().unwrap_or_default();
        let factory_calls = workload.factory_calls.load(Ordering::Relaxed);
        println!(
            "  {}: version {version}, value {value}, {factory_calls} factory calls, derived version {}",
            workload.object.name(),
            workload.doubled.version(),
        );
    }

    for workload in &workloads {
        workload.object.dispose();
    }

    Ok(())
}
