//! Trace session capture
//!
//! The firmware prints status text on the trace channel, announces the start
//! of the binary allocation trace with `trace ready!\n` and closes it with
//! `TRACE_DONE\n`. Everything between the two markers is packed records.

use crate::event::{decode_events, AllocationEvent};
use crate::peak::{estimate_peak, PeakMemory};
use crate::{Result, TraceError};
use std::io::BufRead;

/// Marker line opening the binary region
pub const TRACE_READY: &[u8] = b"trace ready!\n";
/// Marker closing the binary region
pub const TRACE_DONE: &[u8] = b"TRACE_DONE\n";

/// Captured binary region of one trace session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceCapture {
    /// Packed allocation records
    pub region: Vec<u8>,
    /// Text lines seen before `trace ready!`
    pub preamble_lines: usize,
}

impl TraceCapture {
    /// Read lines off the payload stream until a whole session was seen.
    ///
    /// Blocks until `TRACE_DONE` arrives. Lines before the one ending in
    /// `trace ready!` are logged and dropped.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let mut line = Vec::new();
        let mut preamble_lines = 0;

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Err(TraceError::MissingMarker("trace ready!"));
            }
            if line.ends_with(TRACE_READY) {
                tracing::info!("Found trace ready marker");
                break;
            }
            preamble_lines += 1;
            tracing::debug!("trace: {}", String::from_utf8_lossy(&line).trim_end());
        }

        // Binary records may contain 0x0a, so a "line" here is only a chunk
        let mut region = Vec::new();
        loop {
            if reader.read_until(b'\n', &mut region)? == 0 {
                return Err(TraceError::MissingMarker("TRACE_DONE"));
            }
            if region.ends_with(TRACE_DONE) {
                break;
            }
        }
        region.truncate(region.len() - TRACE_DONE.len());

        tracing::debug!("Captured {} bytes of allocation trace", region.len());
        Ok(Self {
            region,
            preamble_lines,
        })
    }

    /// Decode the captured region
    pub fn events(&self) -> Result<Vec<AllocationEvent>> {
        decode_events(&self.region)
    }

    /// Decode the captured region and reduce it to its peak
    pub fn peak_memory(&self) -> Result<PeakMemory> {
        let events = self.events()?;
        Ok(estimate_peak(&events))
    }
}
