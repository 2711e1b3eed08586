//! Measurement records
//!
//! A benchmark is measured in two passes because heap tracing and timing
//! instrumentation cannot share a firmware build. Each pass yields a
//! [`PassReport`]; [`MeasurementBuilder`] merges the two into one
//! [`BenchmarkMeasurement`].

use crate::telemetry::TelemetryRecord;
use bench_harness::{BuildFlags, BuiltImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use swo_tracer::PeakMemory;

/// Firmware variant measured in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    /// Allocator wrapped, heap events streamed over the trace channel
    Trace,
    /// Plain build, timing and stack use reported on the console
    Timing,
}

impl Pass {
    /// Both passes in the order they run
    pub const ALL: [Pass; 2] = [Pass::Trace, Pass::Timing];

    /// Build flags for this pass
    pub fn build_flags(&self, aot: bool, embench: bool) -> BuildFlags {
        BuildFlags {
            heap_trace: matches!(self, Pass::Trace),
            aot,
            embench,
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Trace => f.write_str("trace"),
            Pass::Timing => f.write_str("timing"),
        }
    }
}

/// Data collected by the worker that matters for a pass
#[derive(Debug, Clone, PartialEq)]
pub enum PassData {
    Peak(PeakMemory),
    Telemetry(TelemetryRecord),
}

/// Successful result of one measurement cycle
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub pass: Pass,
    pub image: BuiltImage,
    pub data: PassData,
}

/// Final merged record of one benchmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMeasurement {
    pub name: String,
    pub text_size: u64,
    /// Initialised plus zeroed static data
    pub data_size: u64,
    pub first_delay_ms: u64,
    pub second_delay_ms: Option<u64>,
    pub max_stack_bytes: u64,
    /// `None` when the trace pass failed
    pub peak_memory_bytes: Option<u64>,
    pub score: Option<f64>,
    pub image_sha256: String,
}

/// Collects pass reports of one benchmark
#[derive(Debug, Clone)]
pub struct MeasurementBuilder {
    name: String,
    trace_image: Option<BuiltImage>,
    timing_image: Option<BuiltImage>,
    peak: Option<PeakMemory>,
    telemetry: Option<TelemetryRecord>,
}

impl MeasurementBuilder {
    /// Start collecting for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trace_image: None,
            timing_image: None,
            peak: None,
            telemetry: None,
        }
    }

    /// Add the report of a successful pass
    pub fn record(&mut self, report: PassReport) {
        match report.pass {
            Pass::Trace => self.trace_image = Some(report.image),
            Pass::Timing => self.timing_image = Some(report.image),
        }
        match report.data {
            PassData::Peak(peak) => self.peak = Some(peak),
            PassData::Telemetry(telemetry) => self.telemetry = Some(telemetry),
        }
    }

    /// Merge the passes.
    ///
    /// Returns `None` without timing data. Image sizes come from the trace
    /// pass build when it succeeded, otherwise from the timing pass build.
    pub fn finish(self) -> Option<BenchmarkMeasurement> {
        let telemetry = self.telemetry?;
        let image = self.trace_image.or(self.timing_image)?;

        Some(BenchmarkMeasurement {
            name: self.name,
            text_size: image.size.text,
            data_size: image.size.static_data(),
            first_delay_ms: telemetry.first_delay_ms,
            second_delay_ms: telemetry.second_delay_ms,
            max_stack_bytes: telemetry.max_stack_bytes,
            peak_memory_bytes: self.peak.map(|p| p.peak_bytes),
            score: telemetry.score,
            image_sha256: image.sha256,
        })
    }
}
