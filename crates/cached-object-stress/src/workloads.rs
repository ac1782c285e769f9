use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use cached_object::config::{LoggingConfig, MetricsConfig};
use cached_object::{CachedObject, CachedObjectBuilder, CachedObjectConfig};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    pub operation: Operation,
    #[serde(default)]
    pub object: CachedObjectConfig,
    /// How long the value factory takes.
    #[serde(default, with = "humantime_serde")]
    pub factory_latency: Duration,
    /// How long applying a delta takes.
    #[serde(default, with = "humantime_serde")]
    pub update_latency: Duration,
    /// Passed to every on-demand refresh.
    #[serde(default, with = "humantime_serde")]
    pub refresh_skip: Duration,
    /// Share of refreshes in a `mixed` workload, the rest is split between updates and reads.
    #[serde(default = "default_refresh_ratio")]
    pub refresh_ratio: f64,
}

fn default_refresh_ratio() -> f64 {
    0.1
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Refresh,
    Update,
    Pull,
    Mixed,
}

/// A cached counter: refreshes reset it to the number of factory calls, deltas are added to it.
pub struct PreparedWorkload {
    pub concurrency: usize,
    pub operation: Operation,
    pub refresh_skip: Duration,
    pub refresh_ratio: f64,
    pub object: CachedObject<u64, u64>,
    pub doubled: CachedObject<u64>,
    pub factory_calls: Arc<AtomicU64>,
}

pub fn prepare_workload(workload: Workload) -> PreparedWorkload {
    let factory_calls = Arc::new(AtomicU64::new(0));
    let factory_latency = workload.factory_latency;
    let update_latency = workload.update_latency;

    let object = {
        let factory_calls = Arc::clone(&factory_calls);
        CachedObjectBuilder::new(move |_| {
            let calls = factory_calls.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                tokio::time::sleep(factory_latency).await;
                Ok(calls)
            }
        })
        .with_updates(move |value: Arc<u64>, delta: Arc<u64>, _| async move {
            tokio::time::sleep(update_latency).await;
            Ok(*value + *delta)
        })
        .fetch_updates(|_, _| async { Ok(1) })
        .with_config(&workload.object)
        .build()
    };
    let doubled = object.map(|value| value * 2);

    PreparedWorkload {
        concurrency: workload.concurrency,
        operation: workload.operation,
        refresh_skip: workload.refresh_skip,
        refresh_ratio: workload.refresh_ratio,
        object,
        doubled,
        factory_calls,
    }
}

pub async fn process_workload(workload: &PreparedWorkload) -> Result<()> {
    let operation = match workload.operation {
        Operation::Mixed => {
            let roll: f64 = rand::random();
            if roll < workload.refresh_ratio {
                Operation::Refresh
            } else if roll < (1.0 + workload.refresh_ratio) / 2.0 {
                Operation::Update
            } else {
                Operation::Read
            }
        }
        operation => operation,
    };

    match operation {
        Operation::Read => {
            let value = workload.object.initialize(None).await?;
            let doubled = workload.doubled.initialize(None).await?;
            std::hint::black_box((value, doubled));
        }
        Operation::Refresh => {
            workload
                .object
                .refresh_value(workload.refresh_skip, None)
                .await?
        }
        Operation::Update => workload.object.update_value(1, None).await?,
        Operation::Pull => workload.object.pull_updates(None).await?,
        Operation::Mixed => unreachable!(),
    }
    Ok(())
}
