//! SWO Tracer - Heap trace decoding for microcontroller benchmark runs
//!
//! This crate turns the byte stream relayed by a trace-forwarding server
//! (ITM/SWO-style framing) into allocation events and reduces them to the
//! peak number of live heap bytes.
//!
//! # Overview
//!
//! The pipeline has three stages:
//!
//! * [`FrameReader`] strips hardware frame headers and yields payload bytes
//! * [`TraceCapture`] cuts the binary region out of the payload stream and
//!   [`EventDecoder`] turns it into [`AllocationEvent`]s
//! * [`PeakEstimator`] replays the events against a live allocation table
//!
//! # Usage
//!
//! ```no_run
//! use std::io::BufReader;
//! use std::net::TcpStream;
//! use swo_tracer::{FrameReader, TraceCapture};
//!
//! let stream = TcpStream::connect("localhost:2332").unwrap();
//! let mut payload = BufReader::new(FrameReader::new(stream));
//!
//! let capture = TraceCapture::read_from(&mut payload).unwrap();
//! let peak = capture.peak_memory().unwrap();
//! println!("Peak heap: {} bytes", peak.peak_bytes);
//! ```

pub mod event;
pub mod frame;
pub mod peak;
pub mod session;

pub use event::{decode_events, AllocationEvent, EventDecoder, RECORD_SIZE};
pub use frame::{FrameHeader, FrameReader, FrameStats, ResyncPolicy};
pub use peak::{estimate_peak, ConsistencyFault, PeakEstimator, PeakMemory};
pub use session::{TraceCapture, TRACE_DONE, TRACE_READY};

/// Errors raised while collecting or decoding a heap trace
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Reading the trace channel failed
    #[error("trace channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a session marker was seen
    #[error("trace stream ended before `{0}` marker")]
    MissingMarker(&'static str),

    /// A record carried a tag outside the known event kinds
    #[error("unknown allocation event tag {tag} in record {record}")]
    UnknownTag { tag: u8, record: String },

    /// The region does not end on a record boundary
    #[error("truncated allocation record #{index}: {len} trailing bytes")]
    TruncatedRecord { index: usize, len: usize },
}

/// Result type for tracer operations
pub type Result<T> = std::result::Result<T, TraceError>;
