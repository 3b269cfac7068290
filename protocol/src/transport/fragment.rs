//! # FragmentationCodec
//!
//! Short-range links carry small frames. A BLE characteristic write tops out
//! at the negotiated ATT MTU, so anything larger than one frame is split
//! here and stitched back together on the other side.
//!
//! ## Wire format
//!
//! ```text
//! ┌────────────┬────────────┬───────────────┬──────────────────────┐
//! │ index: u16 │ total: u16 │ checksum: u32 │ payload (≤ mtu − 8)  │
//! └────────────┴────────────┴───────────────┴──────────────────────┘
//!   big-endian   big-endian   CRC-32 (IEEE)
//! ```
//!
//! The message id is not on the wire. A link delivers one message at a time
//! per peer, so the receiver keys reassembly by whatever identifies the
//! sender on that link. Leftovers of a message the sender gave up on are
//! recognised when the next one arrives: a different `total`, or a valid
//! fragment for an occupied slot with a different checksum, starts a fresh
//! buffer.
//!
//! ## Integrity
//!
//! Every fragment carries the CRC-32 of its own payload. A fragment whose
//! checksum does not match is dropped at ingest and must be retransmitted;
//! it is never stitched into a message. After too many mismatches the whole
//! buffer is discarded.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::FRAGMENT_HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("mtu {mtu} leaves no room after the {FRAGMENT_HEADER_LEN}-byte header")]
    MtuTooSmall { mtu: usize },

    #[error("payload needs {needed} fragments, more than a u16 can index")]
    TooManyFragments { needed: usize },

    #[error("frame of {len} bytes is shorter than the fragment header")]
    TooShort { len: usize },

    #[error("fragment {index} declares total 0")]
    ZeroTotal { index: u16 },

    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange { index: u16, total: u16 },

    #[error("fragment total {got} disagrees with buffered total {expected}")]
    TotalMismatch { expected: u16, got: u16 },

    #[error("checksum mismatch on fragment {index}")]
    ChecksumMismatch { index: u16 },

    #[error("message {message_id} discarded after {failures} checksum failures")]
    Discarded { message_id: String, failures: u32 },

    #[error("incomplete message: {received}/{total} fragments")]
    Incomplete { received: u16, total: u16 },
}

/// One MTU-sized slice of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: String,
    pub index: u16,
    pub total: u16,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn new(message_id: &str, index: u16, total: u16, payload: Vec<u8>) -> Self {
        Self {
            message_id: message_id.to_string(),
            index,
            total,
            checksum: crc32fast::hash(&payload),
            payload,
        }
    }

    pub fn checksum_ok(&self) -> bool {
        crc32fast::hash(&self.payload) == self.checksum
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.total.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a wire frame. The checksum is carried, not checked; that is
    /// the reassembler's job.
    pub fn decode(message_id: &str, frame: &[u8]) -> Result<Self, FragmentError> {
        if frame.len() < FRAGMENT_HEADER_LEN {
            return Err(FragmentError::TooShort { len: frame.len() });
        }
        let index = u16::from_be_bytes([frame[0], frame[1]]);
        let total = u16::from_be_bytes([frame[2], frame[3]]);
        let checksum = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        Ok(Self {
            message_id: message_id.to_string(),
            index,
            total,
            checksum,
            payload: frame[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Split `payload` into fragments that each fit in `mtu` bytes on the wire.
///
/// An empty payload still produces one (empty) fragment so the receiver
/// sees a complete message.
pub fn fragment(message_id: &str, payload: &[u8], mtu: usize) -> Result<Vec<Fragment>, FragmentError> {
    let chunk_size = mtu
        .checked_sub(FRAGMENT_HEADER_LEN)
        .filter(|c| *c > 0)
        .ok_or(FragmentError::MtuTooSmall { mtu })?;

    if payload.is_empty() {
        return Ok(vec![Fragment::new(message_id, 0, 1, Vec::new())]);
    }

    let needed = payload.len().div_ceil(chunk_size);
    let total = u16::try_from(needed).map_err(|_| FragmentError::TooManyFragments { needed })?;

    Ok(payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| Fragment::new(message_id, i as u16, total, chunk.to_vec()))
        .collect())
}

/// Reassemble a complete, in-memory fragment set. Order does not matter.
pub fn reassemble(fragments: &[Fragment]) -> Result<Vec<u8>, FragmentError> {
    let total = fragments.first().map(|f| f.total).unwrap_or(0);
    let mut slots: BTreeMap<u16, &Fragment> = BTreeMap::new();
    for frag in fragments {
        if frag.total != total {
            return Err(FragmentError::TotalMismatch {
                expected: total,
                got: frag.total,
            });
        }
        if frag.index >= total {
            return Err(FragmentError::IndexOutOfRange {
                index: frag.index,
                total,
            });
        }
        if !frag.checksum_ok() {
            return Err(FragmentError::ChecksumMismatch { index: frag.index });
        }
        slots.insert(frag.index, frag);
    }
    if total == 0 || slots.len() != total as usize {
        return Err(FragmentError::Incomplete {
            received: slots.len() as u16,
            total,
        });
    }
    Ok(slots.values().flat_map(|f| f.payload.iter().copied()).collect())
}

// ---------------------------------------------------------------------------
// Reassembler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyProgress {
    pub received: u16,
    pub total: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Partial(ReassemblyProgress),
    Complete(Vec<u8>),
}

#[derive(Debug)]
struct Slot {
    checksum: u32,
    /// Arrival order within the buffer.
    arrival: u64,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Buffer {
    total: u16,
    slots: BTreeMap<u16, Slot>,
    arrivals: u64,
    checksum_failures: u32,
    last_activity: u64,
}

impl Buffer {
    fn new(total: u16, now: u64) -> Self {
        Self {
            total,
            slots: BTreeMap::new(),
            arrivals: 0,
            checksum_failures: 0,
            last_activity: now,
        }
    }

    /// Drop the slot at `index` and everything that arrived before it.
    fn drop_through(&mut self, index: u16) {
        if let Some(stale) = self.slots.get(&index).map(|s| s.arrival) {
            self.slots.retain(|_, s| s.arrival > stale);
        }
        self.checksum_failures = 0;
    }
}

/// Incremental reassembly for many concurrent messages.
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<String, Buffer>,
    timeout: Duration,
    max_checksum_failures: u32,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_checksum_failures: u32) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout,
            max_checksum_failures: max_checksum_failures.max(1),
        }
    }

    /// Feed one fragment. `now` is Unix seconds, used for the inactivity
    /// timeout.
    pub fn ingest(&mut self, frag: Fragment, now: u64) -> Result<Ingested, FragmentError> {
        if frag.total == 0 {
            return Err(FragmentError::ZeroTotal { index: frag.index });
        }
        if frag.index >= frag.total {
            return Err(FragmentError::IndexOutOfRange {
                index: frag.index,
                total: frag.total,
            });
        }

        let buffer = self
            .buffers
            .entry(frag.message_id.clone())
            .or_insert_with(|| Buffer::new(frag.total, now));
        buffer.last_activity = now;

        if buffer.total != frag.total {
            debug!(
                message_id = %frag.message_id,
                buffered = buffer.total,
                incoming = frag.total,
                "new message replaces an unfinished one"
            );
            *buffer = Buffer::new(frag.total, now);
        }

        if !frag.checksum_ok() {
            buffer.checksum_failures += 1;
            let failures = buffer.checksum_failures;
            if failures >= self.max_checksum_failures {
                warn!(message_id = %frag.message_id, failures, "discarding reassembly buffer");
                self.buffers.remove(&frag.message_id);
                return Err(FragmentError::Discarded {
                    message_id: frag.message_id,
                    failures,
                });
            }
            debug!(message_id = %frag.message_id, index = frag.index, "checksum mismatch, awaiting retransmit");
            return Err(FragmentError::ChecksumMismatch { index: frag.index });
        }

        let collides = buffer
            .slots
            .get(&frag.index)
            .is_some_and(|slot| slot.checksum != frag.checksum);
        if collides {
            debug!(
                message_id = %frag.message_id,
                index = frag.index,
                "slot already holds another message, starting over"
            );
            buffer.drop_through(frag.index);
        }

        buffer.arrivals += 1;
        let arrival = buffer.arrivals;
        buffer.slots.entry(frag.index).or_insert(Slot {
            checksum: frag.checksum,
            arrival,
            payload: frag.payload,
        });

        let received = buffer.slots.len() as u16;
        let total = buffer.total;
        if received < total {
            return Ok(Ingested::Partial(ReassemblyProgress { received, total }));
        }

        let done = self.buffers.remove(&frag.message_id).map(|b| b.slots);
        let payload = done
            .into_iter()
            .flat_map(|slots| slots.into_values())
            .flat_map(|slot| slot.payload)
            .collect();
        Ok(Ingested::Complete(payload))
    }

    /// Progress of a message still being assembled.
    pub fn progress(&self, message_id: &str) -> Option<ReassemblyProgress> {
        self.buffers.get(message_id).map(|b| ReassemblyProgress {
            received: b.slots.len() as u16,
            total: b.total,
        })
    }

    /// Drop buffers idle for longer than the timeout.
    pub fn purge_stale(&mut self, now: u64) -> usize {
        let timeout = self.timeout.as_secs();
        let before = self.buffers.len();
        self.buffers
            .retain(|_, b| now.saturating_sub(b.last_activity) <= timeout);
        before - self.buffers.len()
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}
