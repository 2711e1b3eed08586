use anyhow::Context;
use bench_runner::{headers, RunConfig, Suite};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use swo_tracer::ResyncPolicy;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "bench-runner",
    about = "Measure WebAssembly benchmarks on a microcontroller: heap peak, run time and stack use."
)]
struct Cli {
    /// Default log level to debug (RUST_LOG still wins)
    #[arg(long, short, global = true, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build, flash and measure every benchmark, then write the results
    Run(RunArgs),
    /// Embed benchmark modules into a C header
    Headers(HeadersArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Resync {
    /// Pass a corrupted header byte on as payload
    EmitHeader,
    /// Drop corrupted header bytes
    Discard,
}

impl From<Resync> for ResyncPolicy {
    fn from(r: Resync) -> Self {
        match r {
            Resync::EmitHeader => ResyncPolicy::EmitHeader,
            Resync::Discard => ResyncPolicy::Discard,
        }
    }
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory with the `*.wasm` benchmarks
    sources: PathBuf,

    /// Directory receiving the result files
    results: PathBuf,

    /// Benchmark suite compiled into the firmware
    #[arg(value_enum)]
    suite: Suite,

    /// Suffix for the result label
    #[arg(long, default_value = "")]
    outname: String,

    /// Build ahead-of-time compiled modules
    #[arg(long, action = clap::ArgAction::SetTrue)]
    aot: bool,

    /// The runtime is linked for semihosting
    #[arg(long, action = clap::ArgAction::SetTrue)]
    semihosted: bool,

    /// Timestamp for result file names, e.g. 2024-03-07T09:05:02 (defaults to now)
    #[arg(long, value_parser = parse_date)]
    date: Option<NaiveDateTime>,

    /// Only run these benchmarks
    #[arg(long, value_delimiter = ',')]
    benches: Vec<String>,

    /// Also write the run report as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// CMake build directory
    #[arg(long, default_value = "./build")]
    build_dir: PathBuf,

    /// Image name inside the build directory
    #[arg(long, default_value = "wamr")]
    image: String,

    /// Berkeley `size` tool
    #[arg(long, default_value = "size")]
    size_tool: PathBuf,

    /// GDB executable
    #[arg(long, default_value = "arm-none-eabihf-gdb")]
    gdb: PathBuf,

    /// GDB server of the debug probe
    #[arg(long, default_value = ":3333")]
    remote: String,

    /// Symbol the target waits on until the collectors listen
    #[arg(long, default_value = "post_main")]
    entry: String,

    /// GDB command timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    gdb_timeout_secs: u64,

    /// Trace-forwarding server
    #[arg(long, default_value = "localhost:2332")]
    trace_addr: String,

    /// Handling of corrupted trace frame headers
    #[arg(long, value_enum, default_value_t = Resync::EmitHeader)]
    resync: Resync,

    /// Give up on a silent trace channel after this long
    #[arg(long, value_name = "MS")]
    trace_idle_ms: Option<u64>,

    /// Serial console device
    #[arg(long, default_value = "/dev/ttyACM0")]
    serial: PathBuf,

    /// Serial line speed; 0 leaves the line settings alone
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Limit for the console to report `END OF TEST`
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    serial_timeout_secs: u64,

    /// Wait after flashing before releasing the target
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    settle_ms: u64,

    /// Wait after each pass so the probe is free again
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    cooldown_ms: u64,

    /// Limit for the collectors to start listening
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    arm_timeout_secs: u64,
}

#[derive(clap::Args, Debug)]
struct HeadersArgs {
    /// Directory with the benchmark modules
    sources: PathBuf,

    /// Directory receiving `benchmarks.h`
    out: PathBuf,

    /// Embed `*.aot` modules instead of `*.wasm`
    #[arg(long, action = clap::ArgAction::SetTrue)]
    aot: bool,
}

fn parse_date(s: &str) -> Result<NaiveDateTime, String> {
    s.parse::<NaiveDateTime>()
        .map_err(|e| format!("expected e.g. 2024-03-07T09:05:02: {e}"))
}

impl RunArgs {
    fn into_config(self) -> RunConfig {
        let mut config = RunConfig::new(self.sources, self.results, self.suite);
        if let Some(date) = self.date {
            config.date = date;
        }
        config.benches = self.benches;
        config.outname = self.outname;
        config.semihosted = self.semihosted;
        config.json = self.json;

        config.build.build_dir = self.build_dir;
        config.build.image_name = self.image;
        config.build.size_tool = self.size_tool;

        config.gdb.gdb = self.gdb;
        config.gdb.remote = self.remote;
        config.gdb.command_timeout = Duration::from_secs(self.gdb_timeout_secs);

        let measure = &mut config.measure;
        measure.aot = self.aot;
        measure.entry_symbol = self.entry;
        measure.trace.addr = self.trace_addr;
        measure.trace.resync = self.resync.into();
        measure.trace.idle_timeout = self
            .trace_idle_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);
        measure.serial.device = self.serial;
        measure.serial.baud = (self.baud > 0).then_some(self.baud);
        measure.serial_timeout = Duration::from_secs(self.serial_timeout_secs);
        measure.settle_delay = Duration::from_millis(self.settle_ms);
        measure.cooldown_delay = Duration::from_millis(self.cooldown_ms);
        measure.arm_timeout = Duration::from_secs(self.arm_timeout_secs);
        config
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Headers(args) => {
            headers::write_header(&args.sources, &args.out, args.aot)?;
            Ok(())
        }
        Command::Run(args) => {
            let config = args.into_config();
            let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
            let result = runtime.block_on(bench_runner::run(&config));
            // A trace reader still connecting on the blocking pool must not keep the process alive
            runtime.shutdown_timeout(Duration::from_secs(1));

            let report = result?;
            if !report.failures.is_empty() {
                tracing::warn!("{} passes failed", report.failures.len());
            }
            Ok(())
        }
    }
}
