//! Serial telemetry
//!
//! The timing firmware prints its results as text on the serial console and
//! ends the run with `END OF TEST`. Fields are found by independent searches
//! over the whole text, so their order does not matter.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Text closing a benchmark run on the console
pub const END_OF_TEST: &str = "END OF TEST";

fn field_pattern(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex must compile")
}

static FIRST_DELAY: LazyLock<Regex> =
    LazyLock::new(|| field_pattern(r"First runtime delay: (\d+)ms"));
static SECOND_DELAY: LazyLock<Regex> =
    LazyLock::new(|| field_pattern(r"Second runtime delay: (\d+)ms"));
static MAX_STACK: LazyLock<Regex> = LazyLock::new(|| field_pattern(r"Max stack use: (\d+)"));
static COREMARK_SCORE: LazyLock<Regex> =
    LazyLock::new(|| field_pattern(r"CoreMark 1\.0 : (\d+\.\d*)"));

/// Errors from the timing worker
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("serial read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial device unavailable: {0}")]
    Open(#[from] bench_harness::HarnessError),

    #[error("no `END OF TEST` within {0:?}")]
    Timeout(Duration),

    #[error("serial stream closed before `END OF TEST`")]
    Closed,

    #[error("required field `{0}` missing from telemetry")]
    MissingField(&'static str),
}

/// Timing results of one run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Load plus first execution, in milliseconds
    pub first_delay_ms: u64,
    /// Second execution on the warm instance, when the firmware reports it
    pub second_delay_ms: Option<u64>,
    /// Deepest stack use measured by the watermark scan
    pub max_stack_bytes: u64,
    /// CoreMark score, only looked for in score mode
    pub score: Option<f64>,
}

/// Read from `source` until `marker` shows up, bounded by `timeout`.
///
/// Returns everything read, marker included.
pub async fn read_until_marker<R>(
    source: &mut R,
    marker: &str,
    timeout: Duration,
) -> Result<String, TelemetryError>
where
    R: AsyncRead + Unpin,
{
    let collect = async {
        let mut text = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Err(TelemetryError::Closed);
            }
            text.extend_from_slice(&buf[..n]);

            // Only the tail can contain a marker completed by this read
            let tail_start = text.len().saturating_sub(n + marker.len());
            if let Some(pos) = find(&text[tail_start..], marker.as_bytes()) {
                text.truncate(tail_start + pos + marker.len());
                return Ok(String::from_utf8_lossy(&text).into_owned());
            }
        }
    };

    tokio::time::timeout(timeout, collect)
        .await
        .map_err(|_| TelemetryError::Timeout(timeout))?
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// First capture of `pattern` in `text`, parsed
fn capture<T: FromStr>(pattern: &Regex, text: &str) -> Option<T> {
    pattern.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Extract the timing fields from console text
pub fn parse_telemetry(text: &str, score_mode: bool) -> Result<TelemetryRecord, TelemetryError> {
    let first_delay_ms = capture(&FIRST_DELAY, text)
        .ok_or(TelemetryError::MissingField("First runtime delay"))?;
    let second_delay_ms = capture(&SECOND_DELAY, text);
    let max_stack_bytes =
        capture(&MAX_STACK, text).ok_or(TelemetryError::MissingField("Max stack use"))?;

    let score = if score_mode {
        let score = capture::<f64>(&COREMARK_SCORE, text);
        match score {
            Some(s) => tracing::info!("Coremark score: {}", s),
            None => tracing::warn!("No CoreMark score in telemetry"),
        }
        score
    } else {
        None
    };

    Ok(TelemetryRecord {
        first_delay_ms,
        second_delay_ms,
        max_stack_bytes,
        score,
    })
}

/// Read one run's console output and parse it
pub async fn collect_telemetry<R>(
    source: &mut R,
    timeout: Duration,
    score_mode: bool,
) -> Result<TelemetryRecord, TelemetryError>
where
    R: AsyncRead + Unpin,
{
    let text = read_until_marker(source, END_OF_TEST, timeout).await?;
    tracing::debug!("Serial output:\n{}", text);
    parse_telemetry(&text, score_mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_harness::{open_serial, SerialConfig};
    use std::io::Write;

    const SAMPLE: &str = "\
booting wamr
First runtime delay: 120ms
Max stack use: 4096
END OF TEST
";

    #[test]
    fn test_parse_without_second_delay() {
        let record = parse_telemetry(SAMPLE, false).unwrap();
        assert_eq!(record.first_delay_ms, 120);
        assert_eq!(record.second_delay_ms, None);
        assert_eq!(record.max_stack_bytes, 4096);
        assert_eq!(record.score, None);
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let text = "Max stack use: 2048\nSecond runtime delay: 80ms\nFirst runtime delay: 95ms\n";
        let record = parse_telemetry(text, false).unwrap();
        assert_eq!(record.first_delay_ms, 95);
        assert_eq!(record.second_delay_ms, Some(80));
        assert_eq!(record.max_stack_bytes, 2048);
    }

    #[test]
    fn test_missing_required_fields() {
        let err = parse_telemetry("Max stack use: 10\n", false).unwrap_err();
        assert!(matches!(err, TelemetryError::MissingField("First runtime delay")));

        let err = parse_telemetry("First runtime delay: 3ms\n", false).unwrap_err();
        assert!(matches!(err, TelemetryError::MissingField("Max stack use")));
    }

    #[test]
    fn test_delay_requires_ms_suffix() {
        let text = "First runtime delay: 12s\nFirst runtime delay: 40ms\nMax stack use: 1\n";
        assert_eq!(parse_telemetry(text, false).unwrap().first_delay_ms, 40);
    }

    #[test]
    fn test_coremark_score() {
        let text = format!("{}CoreMark 1.0 : 123.4 / GCC\n", SAMPLE);
        let record = parse_telemetry(&text, true).unwrap();
        assert_eq!(record.score, Some(123.4));

        // Score is not looked for outside score mode
        assert_eq!(parse_telemetry(&text, false).unwrap().score, None);
        // A missing score is not an error
        assert_eq!(parse_telemetry(SAMPLE, true).unwrap().score, None);
    }

    #[test]
    fn test_score_pattern_is_literal() {
        let text = format!("{}CoreMark 1x0 : 55.5\nCoreMark 1.0 : 99.\n", SAMPLE);
        assert_eq!(parse_telemetry(&text, true).unwrap().score, Some(99.0));
    }

    #[tokio::test]
    async fn test_read_until_marker_stops_at_marker() {
        let mut source: &[u8] = b"line one\nEND OF TEST\ngarbage after";
        let text = read_until_marker(&mut source, END_OF_TEST, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(text, "line one\nEND OF TEST");
    }

    #[tokio::test]
    async fn test_read_until_marker_split_across_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in ["First runtime delay: 7ms\nEND O", "F TE", "ST\n"] {
                tx.write_all(chunk.as_bytes()).await.unwrap();
                tokio::task::yield_now().await;
            }
            tx
        });

        let text = read_until_marker(&mut rx, END_OF_TEST, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(text.ends_with(END_OF_TEST));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_before_marker() {
        let mut source: &[u8] = b"First runtime delay: 7ms\n";
        let err = read_until_marker(&mut source, END_OF_TEST, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_fatal() {
        // Keep the writer half alive so the read blocks forever
        let (_tx, mut rx) = tokio::io::duplex(64);
        let err = collect_telemetry(&mut rx, Duration::from_secs(120), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Timeout(d) if d == Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_timed_out_collection_leaves_next_run_intact() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("ttyACM0");
        let status = std::process::Command::new("mkfifo")
            .arg(&device)
            .status()
            .unwrap();
        assert!(status.success(), "mkfifo failed");
        // Read-write keeps a writer attached, like a board that stays silent
        let mut board = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .unwrap();
        let config = SerialConfig {
            device,
            baud: None,
        };

        let mut port = open_serial(&config).await.unwrap();
        let err = collect_telemetry(&mut port, Duration::from_millis(200), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Timeout(_)));
        drop(port);

        let mut port = open_serial(&config).await.unwrap();
        board.write_all(SAMPLE.as_bytes()).unwrap();
        let record = collect_telemetry(&mut port, Duration::from_secs(2), false)
            .await
            .expect("Next run must see the whole console output");
        assert_eq!(record.first_delay_ms, 120);
        assert_eq!(record.max_stack_bytes, 4096);
    }
}
