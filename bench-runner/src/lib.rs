//! Bench Runner - Orchestration of WebAssembly benchmark runs on a microcontroller
//!
//! Each benchmark is built twice: once with the allocator instrumented to
//! stream heap events over the trace channel, and once plain to measure
//! execution time and stack use reported on the serial console. Both passes
//! are merged into one [`BenchmarkMeasurement`] per benchmark.

pub mod config;
pub mod coordinator;
pub mod discover;
pub mod headers;
pub mod measurement;
pub mod results;
pub mod sequencer;
pub mod telemetry;

pub use config::{BuildConfig, MeasureConfig, RunConfig, Suite, TraceConfig};
pub use coordinator::{Coordinator, PassError};
pub use measurement::{BenchmarkMeasurement, MeasurementBuilder, Pass, PassData, PassReport};
pub use sequencer::{run_benchmarks, PassFailure, RunReport};
pub use telemetry::{parse_telemetry, TelemetryError, TelemetryRecord};

use anyhow::Context;
use bench_harness::{CmakeBuild, GdbConnector};

/// Result type for run orchestration
pub type Result<T> = anyhow::Result<T>;

/// Measure the configured benchmarks on the attached board and write the
/// result files.
pub async fn run(config: &RunConfig) -> Result<RunReport> {
    let benchmarks = discover::select_benchmarks(&config.sources, &config.benches)
        .with_context(|| format!("finding benchmarks in {}", config.sources.display()))?;
    anyhow::ensure!(
        !benchmarks.is_empty(),
        "no benchmarks found in {}",
        config.sources.display()
    );
    tracing::info!("Running {} benchmarks as {}", benchmarks.len(), config.label());

    std::fs::create_dir_all(&config.results_dir)
        .with_context(|| format!("creating {}", config.results_dir.display()))?;

    let mut builder = CmakeBuild::new(config.build.build_dir.clone(), config.build.image_name.clone());
    builder.size_tool = config.build.size_tool.clone();
    let connector = GdbConnector::new(config.gdb.clone());
    let coordinator = Coordinator::new(builder, connector, config.measure.clone());

    let report = run_benchmarks(&coordinator, &benchmarks).await;

    results::write_csv(&config.results_path("csv"), &report.measurements)?;
    if config.json {
        results::write_json(&config.results_path("json"), &report)?;
    }
    Ok(report)
}
