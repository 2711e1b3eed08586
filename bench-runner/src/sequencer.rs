//! Benchmark run sequencing
//!
//! Every benchmark gets a trace pass followed by a timing pass. A failed pass
//! is reported and skipped; it never aborts the rest of the run.

use crate::coordinator::{Coordinator, PassError};
use crate::measurement::{BenchmarkMeasurement, MeasurementBuilder, Pass};
use bench_harness::{BuildDriver, TargetConnector};
use serde::Serialize;

/// A pass that produced no result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassFailure {
    pub benchmark: String,
    pub pass: Pass,
    pub reason: String,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Benchmarks with timing data, in run order
    pub measurements: Vec<BenchmarkMeasurement>,
    /// Every pass that failed
    pub failures: Vec<PassFailure>,
}

impl RunReport {
    fn record_failure(&mut self, benchmark: &str, pass: Pass, error: &PassError) {
        tracing::error!("{} pass of {} failed: {}", pass, benchmark, error);
        self.failures.push(PassFailure {
            benchmark: benchmark.to_string(),
            pass,
            reason: error.to_string(),
        });
    }
}

/// Measure every benchmark in order
pub async fn run_benchmarks<B, C>(coordinator: &Coordinator<B, C>, benchmarks: &[String]) -> RunReport
where
    B: BuildDriver,
    C: TargetConnector,
{
    let mut report = RunReport::default();

    for (i, name) in benchmarks.iter().enumerate() {
        tracing::info!("Benchmark {}/{}: {}", i + 1, benchmarks.len(), name);
        let mut builder = MeasurementBuilder::new(name.as_str());

        for pass in Pass::ALL {
            match coordinator.measure(name, pass).await {
                Ok(pass_report) => builder.record(pass_report),
                Err(e) => report.record_failure(name, pass, &e),
            }
        }

        match builder.finish() {
            Some(measurement) => report.measurements.push(measurement),
            None => tracing::warn!("No timing data for {}, leaving it out of the results", name),
        }
    }

    tracing::info!(
        "Measured {} of {} benchmarks, {} failed passes",
        report.measurements.len(),
        benchmarks.len(),
        report.failures.len()
    );
    report
}
