use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cached_object::config::from_yaml_reader;
use cached_object::{logging, metrics};
use clap::Parser;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod stresstest;
mod workloads;

/// Hammers cached objects with concurrent reads, refreshes and updates.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        from_yaml_reader(workloads_file).context("failed to parse workloads YAML")?;

    logging::init_logging(&workloads.logging);
    metrics::configure(&workloads.metrics)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("stress-worker")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    tracing::info!(
        workloads = workloads.workloads.len(),
        duration = %humantime::format_duration(cli.duration),
        "Starting stresstest"
    );
    runtime.block_on(perform_stresstest(workloads, cli.duration))
}
