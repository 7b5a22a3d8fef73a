//! Benchmark runner for transform pipelines
//!
//! Usage: `flowgate-bench [config.json]`. Log output is controlled through
//! `RUST_LOG`.

use flowgate_bench::{run_benchmark, BenchConfig, BenchResult};
use flowgate_transform::TransformConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn report(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} items/sec", result.throughput);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => BenchConfig::from_file(path)?,
        None => BenchConfig::default(),
    };
    tracing::info!(?config, "starting pipeline benchmarks");

    println!("=== Transform Pipeline Benchmarks ===");
    report(&run_benchmark("configured", &config).await?);

    println!("\n=== Output Buffer Depth ===");
    for readable_high_water_mark in [0.0, 1.0, 16.0, 256.0] {
        let config = BenchConfig {
            transform: TransformConfig {
                readable_high_water_mark,
                ..config.transform.clone()
            },
            ..config.clone()
        };
        report(&run_benchmark(&format!("readable hwm {readable_high_water_mark}"), &config).await?);
    }

    println!("\n=== Chain Length ===");
    for stages in [1, 4, 16] {
        let config = BenchConfig {
            stages,
            ..config.clone()
        };
        report(&run_benchmark(&format!("{stages} stages"), &config).await?);
    }

    Ok(())
}
