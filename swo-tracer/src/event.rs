//! Allocation event records
//!
//! The firmware wraps `malloc`, `realloc` and `free` and writes one packed,
//! little-endian record per call to the trace channel:
//!
//! ```text
//! offset  0      1        5        9        13
//!         +------+--------+--------+--------+
//!         | tag  | word 0 | word 1 | word 2 |
//!         +------+--------+--------+--------+
//! tag 0 (malloc):  new,  size, unused
//! tag 1 (realloc): old,  new,  size
//! tag 2 (free):    old,  unused, unused
//! ```

use crate::{Result, TraceError};
use serde::{Deserialize, Serialize};

/// Size of one encoded record on the wire
pub const RECORD_SIZE: usize = 13;

const TAG_ALLOCATE: u8 = 0;
const TAG_REALLOCATE: u8 = 1;
const TAG_FREE: u8 = 2;

/// One allocator call observed on the target.
///
/// Addresses are opaque values from the target's address space. A zero
/// address stands for a failed call (or `realloc(NULL, ..)` on the old side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationEvent {
    /// `malloc` returned `new_addr` for a request of `size` bytes
    Allocate { new_addr: u32, size: u32 },
    /// `realloc(old_addr, size)` returned `new_addr`
    Reallocate { old_addr: u32, new_addr: u32, size: u32 },
    /// `free(addr)`
    Free { addr: u32 },
}

impl AllocationEvent {
    /// Decode a single record.
    ///
    /// `record` must be exactly [`RECORD_SIZE`] bytes long.
    pub fn decode(record: &[u8; RECORD_SIZE]) -> Result<Self> {
        let word = |i: usize| {
            let start = 1 + i * 4;
            u32::from_le_bytes([
                record[start],
                record[start + 1],
                record[start + 2],
                record[start + 3],
            ])
        };

        match record[0] {
            TAG_ALLOCATE => Ok(AllocationEvent::Allocate {
                new_addr: word(0),
                size: word(1),
            }),
            TAG_REALLOCATE => Ok(AllocationEvent::Reallocate {
                old_addr: word(0),
                new_addr: word(1),
                size: word(2),
            }),
            TAG_FREE => Ok(AllocationEvent::Free { addr: word(0) }),
            tag => Err(TraceError::UnknownTag {
                tag,
                record: hex::encode(record),
            }),
        }
    }

    /// Encode into the wire layout, zero-padding unused words
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let (tag, words) = match *self {
            AllocationEvent::Allocate { new_addr, size } => (TAG_ALLOCATE, [new_addr, size, 0]),
            AllocationEvent::Reallocate {
                old_addr,
                new_addr,
                size,
            } => (TAG_REALLOCATE, [old_addr, new_addr, size]),
            AllocationEvent::Free { addr } => (TAG_FREE, [addr, 0, 0]),
        };

        let mut out = [0u8; RECORD_SIZE];
        out[0] = tag;
        for (i, w) in words.iter().enumerate() {
            out[1 + i * 4..5 + i * 4].copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

/// Iterator decoding a packed record region positionally.
///
/// Record `i` occupies bytes `[i * RECORD_SIZE, (i + 1) * RECORD_SIZE)`.
/// Yields an error for an unknown tag or a trailing partial record and
/// stops after the first error.
#[derive(Debug, Clone)]
pub struct EventDecoder<'a> {
    chunks: std::slice::ChunksExact<'a, u8>,
    index: usize,
    failed: bool,
}

impl<'a> EventDecoder<'a> {
    /// Create a decoder over a binary region
    pub fn new(region: &'a [u8]) -> Self {
        Self {
            chunks: region.chunks_exact(RECORD_SIZE),
            index: 0,
            failed: false,
        }
    }
}

impl Iterator for EventDecoder<'_> {
    type Item = Result<AllocationEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let Some(chunk) = self.chunks.next() else {
            let rest = self.chunks.remainder();
            if rest.is_empty() {
                return None;
            }
            self.failed = true;
            return Some(Err(TraceError::TruncatedRecord {
                index: self.index,
                len: rest.len(),
            }));
        };

        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(chunk);
        let event = AllocationEvent::decode(&record);
        if event.is_err() {
            tracing::debug!("Decoding stopped at record #{}", self.index);
            self.failed = true;
        }
        self.index += 1;
        Some(event)
    }
}

/// Decode a whole binary region into events
pub fn decode_events(region: &[u8]) -> Result<Vec<AllocationEvent>> {
    EventDecoder::new(region).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_allocate() {
        let mut record = [0u8; RECORD_SIZE];
        record[1..5].copy_from_slice(&0x2000_0100u32.to_le_bytes());
        record[5..9].copy_from_slice(&64u32.to_le_bytes());
        record[9..13].copy_from_slice(&[0xff; 4]); // unused word is ignored

        let event = AllocationEvent::decode(&record).unwrap();
        assert_eq!(
            event,
            AllocationEvent::Allocate {
                new_addr: 0x2000_0100,
                size: 64
            }
        );
    }

    #[test]
    fn test_decode_reallocate_word_order() {
        #[rustfmt::skip]
        let record: [u8; RECORD_SIZE] = [
            0x01,
            0x10, 0x00, 0x00, 0x20, // old
            0x40, 0x00, 0x00, 0x20, // new
            0x80, 0x00, 0x00, 0x00, // size
        ];

        let event = AllocationEvent::decode(&record).unwrap();
        assert_eq!(
            event,
            AllocationEvent::Reallocate {
                old_addr: 0x2000_0010,
                new_addr: 0x2000_0040,
                size: 0x80
            }
        );
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let mut region = AllocationEvent::Free { addr: 8 }.encode().to_vec();
        let mut bad = [0u8; RECORD_SIZE];
        bad[0] = 7;
        region.extend_from_slice(&bad);
        region.extend_from_slice(&AllocationEvent::Free { addr: 16 }.encode());

        let err = decode_events(&region).unwrap_err();
        match err {
            TraceError::UnknownTag { tag, record } => {
                assert_eq!(tag, 7);
                assert_eq!(record.len(), RECORD_SIZE * 2, "Record should be hex encoded");
            }
            other => panic!("Expected UnknownTag, got {:?}", other),
        }

        // The decoder stops at the first fault
        let decoded: Vec<_> = EventDecoder::new(&region).collect();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_trailing_partial_record() {
        let mut region = AllocationEvent::Allocate { new_addr: 4, size: 4 }
            .encode()
            .to_vec();
        region.extend_from_slice(&[0, 1, 2]);

        match decode_events(&region).unwrap_err() {
            TraceError::TruncatedRecord { index, len } => {
                assert_eq!(index, 1);
                assert_eq!(len, 3);
            }
            other => panic!("Expected TruncatedRecord, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_region() {
        assert!(decode_events(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_encode_matches_decoder() {
        let events = [
            AllocationEvent::Allocate { new_addr: 0x100, size: 10 },
            AllocationEvent::Reallocate { old_addr: 0x100, new_addr: 0x200, size: 30 },
            AllocationEvent::Free { addr: 0x200 },
        ];
        let region: Vec<u8> = events.iter().flat_map(|e| e.encode()).collect();

        assert_eq!(region.len(), 3 * RECORD_SIZE);
        assert_eq!(decode_events(&region).unwrap(), events);
    }
}
