//! Concurrent measurement cycle
//!
//! One cycle builds a firmware variant, starts both telemetry collectors,
//! flashes the target, releases it once both collectors listen, and collects
//! the result that matters for the pass.
//!
//! The heap trace collector runs on the blocking pool and reads the trace
//! socket; the console collector is an async task reading the serial device.
//! Each reports back over two single-use channels: one when it is listening
//! ("armed") and one with its result.

use crate::config::{MeasureConfig, Suite, TraceConfig};
use crate::measurement::{Pass, PassData, PassReport};
use crate::telemetry::{collect_telemetry, TelemetryError, TelemetryRecord};
use bench_harness::{
    flash_to_entry, open_serial, release_from_entry, BuildDriver, BuiltImage, HarnessError,
    SerialConfig, TargetConnector, TargetLifecycle,
};
use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use swo_tracer::{FrameReader, PeakMemory, TraceCapture, TraceError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Why a pass produced no result
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("build failed: {0}")]
    Build(#[source] HarnessError),

    #[error("target control failed: {0}")]
    Target(#[source] HarnessError),

    #[error("heap trace failed: {0}")]
    Trace(#[from] TraceError),

    #[error("telemetry failed: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("{worker} collector not listening after {timeout:?}")]
    NotArmed {
        worker: &'static str,
        timeout: Duration,
    },

    #[error("{0} collector stopped without a result")]
    WorkerLost(&'static str),
}

/// Outcome of waiting for a collector to listen
enum Armed<A> {
    Ready(A),
    Stopped,
    TimedOut,
}

/// Handle on a spawned collector
struct Worker<A, T> {
    name: &'static str,
    armed: oneshot::Receiver<A>,
    result: oneshot::Receiver<Result<T, PassError>>,
    task: JoinHandle<()>,
}

impl<A, T> Worker<A, T> {
    async fn wait_armed(&mut self, timeout: Duration) -> Armed<A> {
        match tokio::time::timeout(timeout, &mut self.armed).await {
            Ok(Ok(value)) => Armed::Ready(value),
            Ok(Err(_)) => Armed::Stopped,
            Err(_) => Armed::TimedOut,
        }
    }

    async fn join(self) -> Result<T, PassError> {
        self.result
            .await
            .unwrap_or(Err(PassError::WorkerLost(self.name)))
    }

    /// Reason the collector failed to arm
    async fn arm_error(self, armed: Armed<A>, timeout: Duration) -> PassError {
        let name = self.name;
        match armed {
            Armed::TimedOut => PassError::NotArmed {
                worker: name,
                timeout,
            },
            Armed::Ready(_) | Armed::Stopped => match self.join().await {
                Err(e) => e,
                Ok(_) => PassError::WorkerLost(name),
            },
        }
    }
}

type TraceWorker = Worker<TcpStream, PeakMemory>;
type TimingWorker = Worker<(), TelemetryRecord>;

/// Connect to the trace server and reduce one trace session to its peak.
///
/// A clone of the socket is handed out through `armed` so the owner can
/// shut the connection down and unblock this reader.
fn collect_heap_trace(
    config: &TraceConfig,
    armed: oneshot::Sender<TcpStream>,
) -> Result<PeakMemory, TraceError> {
    let stream = TcpStream::connect(&config.addr)?;
    stream.set_read_timeout(config.idle_timeout)?;
    // The receiver is gone only if the cycle is already over
    let _ = armed.send(stream.try_clone()?);
    tracing::debug!("Trace channel connected to {}", config.addr);

    let mut payload = BufReader::new(FrameReader::with_policy(stream, config.resync));
    let capture = TraceCapture::read_from(&mut payload)?;

    let stats = payload.get_ref().stats();
    if stats.resyncs > 0 {
        tracing::warn!(
            "Trace had {} corrupted frame headers in {} frames",
            stats.resyncs,
            stats.frames
        );
    }

    let peak = capture.peak_memory()?;
    if peak.faults > 0 {
        tracing::warn!("{} of {} heap events were inconsistent", peak.faults, peak.events);
    }
    Ok(peak)
}

fn spawn_trace_worker(config: TraceConfig) -> TraceWorker {
    let (armed_tx, armed_rx) = oneshot::channel();
    let (result_tx, result_rx) = oneshot::channel();

    let task = tokio::task::spawn_blocking(move || {
        let result = collect_heap_trace(&config, armed_tx).map_err(PassError::from);
        let _ = result_tx.send(result);
    });

    Worker {
        name: "trace",
        armed: armed_rx,
        result: result_rx,
        task,
    }
}

fn spawn_timing_worker(serial: SerialConfig, timeout: Duration, score_mode: bool) -> TimingWorker {
    let (armed_tx, armed_rx) = oneshot::channel();
    let (result_tx, result_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let result = async {
            let mut port = open_serial(&serial).await.map_err(TelemetryError::Open)?;
            let _ = armed_tx.send(());
            tracing::debug!("Listening on {}", serial.device.display());
            collect_telemetry(&mut port, timeout, score_mode).await
        }
        .await;
        let _ = result_tx.send(result.map_err(PassError::from));
    });

    Worker {
        name: "timing",
        armed: armed_rx,
        result: result_rx,
        task,
    }
}

/// Both collectors of one cycle.
///
/// Dropping it shuts the trace socket down and aborts the console task, so
/// neither outlives its cycle.
struct Collectors {
    trace: Option<TraceWorker>,
    timing: Option<TimingWorker>,
    trace_socket: Option<TcpStream>,
}

impl Collectors {
    fn spawn(config: &MeasureConfig) -> Self {
        Self {
            trace: Some(spawn_trace_worker(config.trace.clone())),
            timing: Some(spawn_timing_worker(
                config.serial.clone(),
                config.serial_timeout,
                config.suite.score_mode(),
            )),
            trace_socket: None,
        }
    }

    /// Wait until both collectors listen.
    ///
    /// Only the collector the pass depends on is required to arm.
    async fn wait_armed(&mut self, pass: Pass, timeout: Duration) -> Result<(), PassError> {
        let (Some(trace), Some(timing)) = (self.trace.as_mut(), self.timing.as_mut()) else {
            return Err(PassError::WorkerLost("collector"));
        };
        let (trace_armed, timing_armed) =
            tokio::join!(trace.wait_armed(timeout), timing.wait_armed(timeout));

        match trace_armed {
            Armed::Ready(socket) => self.trace_socket = Some(socket),
            armed if pass == Pass::Trace => {
                let worker = self.trace.take().ok_or(PassError::WorkerLost("trace"))?;
                return Err(worker.arm_error(armed, timeout).await);
            }
            _ => tracing::warn!("Trace collector not listening; not needed for this pass"),
        }

        match timing_armed {
            Armed::Ready(()) => {}
            armed if pass == Pass::Timing => {
                let worker = self.timing.take().ok_or(PassError::WorkerLost("timing"))?;
                return Err(worker.arm_error(armed, timeout).await);
            }
            _ => tracing::warn!("Timing collector not listening; not needed for this pass"),
        }
        Ok(())
    }

    /// Collect the result the pass depends on
    async fn collect(&mut self, pass: Pass) -> Result<PassData, PassError> {
        match pass {
            Pass::Trace => {
                let worker = self.trace.take().ok_or(PassError::WorkerLost("trace"))?;
                let peak = worker.join().await?;
                tracing::info!("Got heap: {}", peak.peak_bytes);

                // The console result is unused, but the port must be free for the next pass
                if let Some(timing) = self.timing.take() {
                    if let Err(e) = timing.join().await {
                        tracing::debug!("Ignoring timing collector on trace pass: {}", e);
                    }
                }
                Ok(PassData::Peak(peak))
            }
            Pass::Timing => {
                let worker = self.timing.take().ok_or(PassError::WorkerLost("timing"))?;
                let record = worker.join().await?;
                tracing::info!(
                    "Got timing: first {}ms, second {:?}ms, stack {}",
                    record.first_delay_ms,
                    record.second_delay_ms,
                    record.max_stack_bytes
                );
                Ok(PassData::Telemetry(record))
            }
        }
    }

    fn shutdown(&mut self) {
        let socket = self
            .trace_socket
            .take()
            .or_else(|| self.trace.as_mut().and_then(|w| w.armed.try_recv().ok()));
        if let Some(socket) = socket {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                tracing::debug!("Trace socket shutdown: {}", e);
            }
        }
        if let Some(timing) = self.timing.take() {
            timing.task.abort();
        }
    }
}

impl Drop for Collectors {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resources held by a cycle that teardown must release
struct Cycle<T> {
    target: Option<T>,
    collectors: Option<Collectors>,
}

/// Runs measurement cycles against one board
pub struct Coordinator<B, C> {
    builder: B,
    connector: C,
    config: MeasureConfig,
}

impl<B, C> Coordinator<B, C>
where
    B: BuildDriver,
    C: TargetConnector,
{
    /// Create a coordinator
    pub fn new(builder: B, connector: C, config: MeasureConfig) -> Self {
        Self {
            builder,
            connector,
            config,
        }
    }

    /// Cycle settings
    pub fn config(&self) -> &MeasureConfig {
        &self.config
    }

    /// Run one full measurement cycle of `benchmark` for `pass`.
    ///
    /// The debug session is terminated and the cool-down observed on every
    /// return path.
    pub async fn measure(&self, benchmark: &str, pass: Pass) -> Result<PassReport, PassError> {
        tracing::info!("Starting {} pass of {}", pass, benchmark);
        let mut cycle = Cycle {
            target: None,
            collectors: None,
        };

        let outcome = self.run_cycle(benchmark, pass, &mut cycle).await;
        self.teardown(cycle).await;
        outcome
    }

    async fn run_cycle(
        &self,
        benchmark: &str,
        pass: Pass,
        cycle: &mut Cycle<C::Target>,
    ) -> Result<PassReport, PassError> {
        self.builder.clean().await.map_err(PassError::Build)?;
        let flags = pass.build_flags(self.config.aot, self.config.suite == Suite::Embench);
        let image: BuiltImage = self
            .builder
            .configure_and_build(benchmark, &flags)
            .await
            .map_err(PassError::Build)?;

        // Collectors must be spawned before the target can produce output
        let collectors = cycle.collectors.insert(Collectors::spawn(&self.config));

        let target = self.connector.connect().await.map_err(PassError::Target)?;
        let target = cycle.target.insert(target);
        flash_to_entry(target, &image.path, &self.config.entry_symbol)
            .await
            .map_err(PassError::Target)?;

        tokio::time::sleep(self.config.settle_delay).await;
        collectors.wait_armed(pass, self.config.arm_timeout).await?;

        tracing::info!("Getting measurements");
        release_from_entry(target).await.map_err(PassError::Target)?;

        let data = collectors.collect(pass).await?;
        Ok(PassReport { pass, image, data })
    }

    async fn teardown(&self, cycle: Cycle<C::Target>) {
        drop(cycle.collectors);

        if let Some(target) = cycle.target {
            if let Err(e) = target.terminate_session().await {
                tracing::warn!("Failed to terminate debug session: {}", e);
            }
        }
        tokio::time::sleep(self.config.cooldown_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use swo_tracer::{AllocationEvent, TRACE_DONE, TRACE_READY};

    /// Wrap every byte in a one-byte frame
    fn framed(payload: &[u8]) -> Vec<u8> {
        payload.iter().flat_map(|&b| [0x01, b]).collect()
    }

    fn local_trace_config(listener: &TcpListener) -> TraceConfig {
        TraceConfig {
            addr: listener.local_addr().unwrap().to_string(),
            ..TraceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_trace_worker_reports_peak() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = local_trace_config(&listener);

        let mut payload = b"booting\n".to_vec();
        payload.extend_from_slice(TRACE_READY);
        payload.extend_from_slice(
            &AllocationEvent::Allocate {
                new_addr: 0x2000_0000,
                size: 4096,
            }
            .encode(),
        );
        payload.extend_from_slice(TRACE_DONE);

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&framed(&payload)).unwrap();
            stream
        });

        let mut worker = spawn_trace_worker(config);
        assert!(matches!(
            worker.wait_armed(Duration::from_secs(5)).await,
            Armed::Ready(_)
        ));
        let peak = worker.join().await.unwrap();
        assert_eq!(peak.peak_bytes, 4096);
        assert_eq!(peak.events, 1);
        drop(server.join().unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_trace_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = local_trace_config(&listener);
        let server = std::thread::spawn(move || listener.accept().map(|(s, _)| s));

        let mut worker = spawn_trace_worker(config);
        let socket = match worker.wait_armed(Duration::from_secs(5)).await {
            Armed::Ready(socket) => socket,
            _ => panic!("trace collector did not arm"),
        };
        // Server stays connected and silent
        let _held = server.join().unwrap().unwrap();

        socket.shutdown(Shutdown::Both).unwrap();
        let err = worker.join().await.unwrap_err();
        assert!(
            matches!(err, PassError::Trace(TraceError::MissingMarker(_))),
            "Shut down channel should end the capture, got {err}"
        );
    }

    #[tokio::test]
    async fn test_unreachable_trace_server_is_arm_failure() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let mut worker = spawn_trace_worker(TraceConfig {
            addr,
            ..TraceConfig::default()
        });

        let armed = worker.wait_armed(Duration::from_secs(5)).await;
        assert!(matches!(armed, Armed::Stopped));
        let err = worker.arm_error(armed, Duration::from_secs(5)).await;
        assert!(matches!(err, PassError::Trace(TraceError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_timing_worker_times_out_arming() {
        let (_armed_tx, armed_rx) = oneshot::channel::<()>();
        let (_result_tx, result_rx) = oneshot::channel();
        let mut worker: TimingWorker = Worker {
            name: "timing",
            armed: armed_rx,
            result: result_rx,
            task: tokio::spawn(async {}),
        };

        let armed = worker.wait_armed(Duration::from_secs(10)).await;
        assert!(matches!(armed, Armed::TimedOut));
        let err = worker.arm_error(armed, Duration::from_secs(10)).await;
        assert!(matches!(err, PassError::NotArmed { worker: "timing", .. }));
    }
}
