//! Run configuration
//!
//! Everything a benchmark run can be tuned with, grouped by the component
//! that consumes it.

use bench_harness::{GdbConfig, SerialConfig};
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::time::Duration;
use swo_tracer::ResyncPolicy;

/// Benchmark suite compiled into the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Suite {
    Embench,
    Coremark,
}

impl Suite {
    /// Name used in result labels
    pub fn name(&self) -> &'static str {
        match self {
            Suite::Embench => "embench",
            Suite::Coremark => "coremark",
        }
    }

    /// Whether the console reports a CoreMark score
    pub fn score_mode(&self) -> bool {
        matches!(self, Suite::Coremark)
    }
}

/// Trace channel settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Trace-forwarding server address
    pub addr: String,
    /// Handling of undecodable frame headers
    pub resync: ResyncPolicy,
    /// Give up when the channel is silent this long; `None` waits forever
    pub idle_timeout: Option<Duration>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:2332".to_string(),
            resync: ResyncPolicy::EmitHeader,
            idle_timeout: None,
        }
    }
}

/// Settings for one measurement cycle
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureConfig {
    /// Trace channel
    pub trace: TraceConfig,
    /// Serial console
    pub serial: SerialConfig,
    /// Hard limit for the console to print `END OF TEST`
    pub serial_timeout: Duration,
    /// Symbol the target is parked on until both collectors listen
    pub entry_symbol: String,
    /// Suite compiled into the firmware
    pub suite: Suite,
    /// Build AOT-compiled modules
    pub aot: bool,
    /// Wait after flashing before releasing the target
    pub settle_delay: Duration,
    /// Wait after closing the debug session, so the probe is free again
    pub cooldown_delay: Duration,
    /// Limit for the collectors to report they are listening
    pub arm_timeout: Duration,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            trace: TraceConfig::default(),
            serial: SerialConfig::default(),
            serial_timeout: Duration::from_secs(120),
            entry_symbol: "post_main".to_string(),
            suite: Suite::Embench,
            aot: false,
            settle_delay: Duration::from_secs(1),
            cooldown_delay: Duration::from_secs(3),
            arm_timeout: Duration::from_secs(10),
        }
    }
}

/// Firmware build settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// CMake build directory
    pub build_dir: PathBuf,
    /// Image name inside the build directory
    pub image_name: String,
    /// Berkeley `size` tool
    pub size_tool: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("./build"),
            image_name: "wamr".to_string(),
            size_tool: PathBuf::from("size"),
        }
    }
}

/// Complete configuration of a benchmark run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory searched for `*.wasm` benchmarks
    pub sources: PathBuf,
    /// Directory receiving the result files
    pub results_dir: PathBuf,
    /// Benchmarks to run; empty means all discovered ones
    pub benches: Vec<String>,
    /// Suffix appended to the result label
    pub outname: String,
    /// The runtime is linked for semihosting
    pub semihosted: bool,
    /// Timestamp used in result file names
    pub date: NaiveDateTime,
    /// Also write results as JSON
    pub json: bool,
    /// Firmware build
    pub build: BuildConfig,
    /// Debugger
    pub gdb: GdbConfig,
    /// Measurement cycle
    pub measure: MeasureConfig,
}

impl RunConfig {
    /// Create a configuration with default tool settings
    pub fn new(sources: impl Into<PathBuf>, results_dir: impl Into<PathBuf>, suite: Suite) -> Self {
        Self {
            sources: sources.into(),
            results_dir: results_dir.into(),
            benches: Vec::new(),
            outname: String::new(),
            semihosted: false,
            date: chrono::Local::now().naive_local(),
            json: false,
            build: BuildConfig::default(),
            gdb: GdbConfig::default(),
            measure: MeasureConfig {
                suite,
                ..MeasureConfig::default()
            },
        }
    }

    /// Label naming the configuration, e.g. `coremark-aot-standalone_run1`
    pub fn label(&self) -> String {
        let mut label = self.measure.suite.name().to_string();
        if self.measure.aot {
            label.push_str("-aot");
        }
        label.push_str(if self.semihosted {
            "-semihosted"
        } else {
            "-standalone"
        });
        label.push('_');
        label.push_str(&self.outname);
        label
    }

    /// Timestamp prefix of result files
    pub fn date_stamp(&self) -> String {
        self.date.format("%m-%d_%H-%M-%S").to_string()
    }

    /// Result file path for the given extension
    pub fn results_path(&self, extension: &str) -> PathBuf {
        self.results_dir
            .join(format!("{}__{}.{}", self.date_stamp(), self.label(), extension))
    }
}
