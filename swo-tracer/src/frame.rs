//! Trace frame reader
//!
//! Strips the one-byte hardware framing headers off the byte stream relayed by
//! a trace-forwarding server and yields the bare application payload.
//!
//! Each frame starts with a header whose low bits encode a size class:
//!
//! | size class | payload bytes |
//! |-----------:|--------------:|
//! | 1          | 1             |
//! | 2          | 2             |
//! | 3          | 4             |
//!
//! A header above 3, or one whose low two bits are zero, cannot be told apart
//! from a framing slip. What happens next is decided by [`ResyncPolicy`].

use serde::{Deserialize, Serialize};
use std::io::{self, Read};

/// Payload lengths indexed by size class.
const PAYLOAD_LEN: [usize; 4] = [0, 1, 2, 4];

/// What to do with a header byte that does not describe a valid frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncPolicy {
    /// Hand the header byte to the caller as a one-byte payload and read the
    /// next header. Keeps ASCII text intact when the forwarder drops framing.
    #[default]
    EmitHeader,
    /// Drop the header byte and read the next header.
    Discard,
}

/// Classification of a single header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// A valid header followed by this many payload bytes
    Payload(usize),
    /// A header that cannot be trusted
    Corrupt(u8),
}

impl FrameHeader {
    /// Classify a raw header byte
    pub fn classify(header: u8) -> Self {
        if header > 3 || header & 0x3 == 0 {
            FrameHeader::Corrupt(header)
        } else {
            FrameHeader::Payload(PAYLOAD_LEN[header as usize])
        }
    }
}

/// Counters kept while reading frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Well-formed frames read
    pub frames: u64,
    /// Headers treated as framing corruption
    pub resyncs: u64,
}

/// Reader that turns a framed trace stream into its payload bytes.
///
/// Every successful `read` returns the payload of exactly one frame (or the
/// tail of a frame that did not fit into the previous caller buffer). Wrap it
/// in a [`std::io::BufReader`] to get line access over the payload stream.
///
/// Returns `Ok(0)` once the underlying connection is closed on a frame
/// boundary. A connection closed inside a payload is an
/// [`io::ErrorKind::UnexpectedEof`] error.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    policy: ResyncPolicy,
    pending: [u8; 4],
    pending_start: usize,
    pending_end: usize,
    stats: FrameStats,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader with the default resync policy
    pub fn new(inner: R) -> Self {
        Self::with_policy(inner, ResyncPolicy::default())
    }

    /// Create a reader with an explicit resync policy
    pub fn with_policy(inner: R, policy: ResyncPolicy) -> Self {
        Self {
            inner,
            policy,
            pending: [0; 4],
            pending_start: 0,
            pending_end: 0,
            stats: FrameStats::default(),
        }
    }

    /// Frame counters accumulated so far
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Unwrap the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next frame into the pending buffer.
    ///
    /// Returns false on a clean end of stream.
    fn fill_pending(&mut self) -> io::Result<bool> {
        loop {
            let mut header = [0u8; 1];
            match self.inner.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            }

            match FrameHeader::classify(header[0]) {
                FrameHeader::Payload(len) => {
                    // read_exact retries short reads until the whole payload is in
                    self.inner.read_exact(&mut self.pending[..len])?;
                    self.pending_start = 0;
                    self.pending_end = len;
                    self.stats.frames += 1;
                    return Ok(true);
                }
                FrameHeader::Corrupt(byte) => {
                    self.stats.resyncs += 1;
                    tracing::warn!("Corrupted trace frame header 0x{:02x}, resynchronizing", byte);
                    match self.policy {
                        ResyncPolicy::EmitHeader => {
                            self.pending[0] = byte;
                            self.pending_start = 0;
                            self.pending_end = 1;
                            return Ok(true);
                        }
                        ResyncPolicy::Discard => continue,
                    }
                }
            }
        }
    }
}

impl<R: Read> Read for FrameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending_start == self.pending_end && !self.fill_pending()? {
            return Ok(0);
        }

        let available = &self.pending[self.pending_start..self.pending_end];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_start += n;
        Ok(n)
    }
}
