//! Result persistence
//!
//! One CSV line per benchmark:
//! `name,text,data,first_delay,second_delay,max_stack,peak_memory`, with `-1`
//! standing in for an absent second delay or peak.

use crate::measurement::BenchmarkMeasurement;
use crate::sequencer::RunReport;
use anyhow::Context;
use std::path::Path;

fn or_absent(value: Option<u64>) -> String {
    value.map_or_else(|| "-1".to_string(), |v| v.to_string())
}

/// CSV line of one benchmark, without line terminator
pub fn csv_row(m: &BenchmarkMeasurement) -> String {
    format!(
        "{},{},{},{},{},{},{}",
        m.name,
        m.text_size,
        m.data_size,
        m.first_delay_ms,
        or_absent(m.second_delay_ms),
        m.max_stack_bytes,
        or_absent(m.peak_memory_bytes)
    )
}

/// Write all measurements as CSV
pub fn write_csv(path: &Path, measurements: &[BenchmarkMeasurement]) -> anyhow::Result<()> {
    let mut text = String::new();
    for m in measurements {
        text.push_str(&csv_row(m));
        text.push('\n');
    }
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!("Wrote {} results to {}", measurements.len(), path.display());
    Ok(())
}

/// Write the whole run report, failures included, as pretty JSON
pub fn write_json(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!("Wrote JSON report to {}", path.display());
    Ok(())
}
