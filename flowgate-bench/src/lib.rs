//! Throughput benchmarks for transform pipelines

#![warn(missing_docs)]

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use flowgate_core::{PipeOptions, ReadableStream};
use flowgate_transform::{
    PipeThrough, TransformConfig, TransformController, TransformStream, Transformer,
};
use futures::future;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Benchmark configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Timed iterations
    pub iterations: usize,

    /// Untimed iterations run first
    pub warmup_iterations: usize,

    /// Items pushed through the chain per iteration
    pub items_per_iteration: u64,

    /// Number of pipelines chained one after another
    pub stages: usize,

    /// High-water marks used for every stage
    pub transform: TransformConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 2,
            items_per_iteration: 10_000,
            stages: 4,
            transform: TransformConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Load a configuration from a JSON file; missing keys take defaults
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading bench config {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("parsing bench config {}", path.display()))
    }
}

/// Benchmark result
#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Throughput (items/second through the whole chain)
    pub throughput: f64,
}

fn increment() -> Transformer<u64, u64> {
    Transformer::from_fn(|item: u64, controller: TransformController<u64>| {
        future::ready(controller.enqueue(item + 1))
    })
}

/// Push one iteration's worth of items through a chain of pipelines
///
/// Every stage adds one to each item. Returns the number of items read from
/// the end of the chain after checking that none was lost or reordered.
pub async fn run_iteration(config: &BenchConfig) -> anyhow::Result<u64> {
    let mut output = ReadableStream::from_iter(0..config.items_per_iteration)?;
    for _ in 0..config.stages {
        let stage = TransformStream::from_config(increment(), &config.transform)?;
        output = output.pipe_through(stage, PipeOptions::default())?;
    }

    let offset = config.stages as u64;
    let reader = output.get_reader()?;
    let mut expected = 0;
    while let Some(item) = reader.read().await? {
        ensure!(
            item == expected + offset,
            "item {expected} came out as {item} after {offset} stages"
        );
        expected += 1;
    }
    ensure!(
        expected == config.items_per_iteration,
        "read {expected} of {} items",
        config.items_per_iteration
    );
    Ok(expected)
}

/// Run warmup and timed iterations and summarize the timings
pub async fn run_benchmark(name: &str, config: &BenchConfig) -> anyhow::Result<BenchResult> {
    ensure!(config.iterations > 0, "at least one timed iteration is required");

    for _ in 0..config.warmup_iterations {
        run_iteration(config).await?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let start_total = Instant::now();
    for iteration in 0..config.iterations {
        let start = Instant::now();
        run_iteration(config).await?;
        let elapsed = start.elapsed();
        debug!(iteration, ?elapsed, "iteration finished");
        times.push(elapsed);
    }
    let total_time = start_total.elapsed();

    let avg_time = times.iter().sum::<Duration>() / u32::try_from(times.len())?;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();

    #[allow(clippy::cast_precision_loss)]
    let total_items = (config.items_per_iteration * config.iterations as u64) as f64;
    let throughput = total_items / total_time.as_secs_f64();

    info!(benchmark = name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}
