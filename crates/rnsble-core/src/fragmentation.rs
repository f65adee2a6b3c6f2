//! Packet fragmentation and reassembly for BLE link MTUs
//!
//! Mesh packets are up to [`crate::HW_MTU`] bytes, while a BLE connection
//! carries at most the negotiated ATT MTU per write. The codec splits each
//! outbound packet into frames with a 5-byte header and rebuilds inbound
//! frames into the original packet, tolerating reordering and duplicates.

use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::error::FragmentError;

// ----------------------------------------------------------------------------
// Wire Format
// ----------------------------------------------------------------------------

/// Size of the frame header: type (1) + sequence (2) + total (2).
pub const FRAME_HEADER_LEN: usize = 5;

/// Position of a frame within its packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// First frame of a multi-frame packet.
    Start = 0x01,
    /// Interior frame.
    Continue = 0x02,
    /// Final frame; a single-frame packet is a lone `End`.
    End = 0x03,
}

impl FrameType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Self::Start),
            0x02 => Some(Self::Continue),
            0x03 => Some(Self::End),
            _ => None,
        }
    }
}

/// Decoded 5-byte frame header. `sequence` and `total` are big-endian on the
/// wire; `sequence` is the 0-based frame index, `total` the frame count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub sequence: u16,
    pub total: u16,
}

impl FrameHeader {
    /// Encode the header into its wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let sequence = self.sequence.to_be_bytes();
        let total = self.total.to_be_bytes();
        [
            self.frame_type as u8,
            sequence[0],
            sequence[1],
            total[0],
            total[1],
        ]
    }

    /// Decode a header from the front of a received frame.
    pub fn decode(frame: &[u8]) -> Result<Self, FragmentError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(FragmentError::MalformedFrame {
                reason: "frame shorter than the 5-byte header",
            });
        }
        let frame_type =
            FrameType::from_u8(frame[0]).ok_or(FragmentError::MalformedFrame {
                reason: "unknown frame type",
            })?;
        let sequence = u16::from_be_bytes([frame[1], frame[2]]);
        let total = u16::from_be_bytes([frame[3], frame[4]]);
        Ok(Self {
            frame_type,
            sequence,
            total,
        })
    }
}

// ----------------------------------------------------------------------------
// Fragmenter
// ----------------------------------------------------------------------------

/// Splits packets into MTU-sized frames for one peer link.
///
/// A fragmenter is created per peer once the link MTU is known and replaced
/// when the MTU renegotiates.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    mtu: usize,
}

impl Fragmenter {
    /// Create a fragmenter for a negotiated link MTU. The MTU must leave at
    /// least one payload byte after the frame header.
    pub fn new(mtu: usize) -> Result<Self, FragmentError> {
        if mtu <= FRAME_HEADER_LEN {
            return Err(FragmentError::MtuTooSmall { mtu });
        }
        Ok(Self { mtu })
    }

    /// The link MTU this fragmenter was built for.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Payload bytes available per frame.
    pub fn payload_budget(&self) -> usize {
        self.mtu - FRAME_HEADER_LEN
    }

    /// Split a packet into frames.
    ///
    /// A packet that fits one frame becomes a lone `End`; otherwise the first
    /// frame is `Start`, interior frames `Continue`, and the last `End`.
    /// Every frame carries its 0-based sequence and the total frame count.
    pub fn fragment(&self, packet: &[u8]) -> Result<SmallVec<[Vec<u8>; 4]>, FragmentError> {
        if packet.is_empty() {
            return Err(FragmentError::EmptyPacket);
        }

        let budget = self.payload_budget();
        let total = packet.len().div_ceil(budget);
        if total > usize::from(u16::MAX) {
            return Err(FragmentError::PacketTooLarge {
                len: packet.len(),
                mtu: self.mtu,
                max: usize::from(u16::MAX),
            });
        }

        let mut frames = SmallVec::with_capacity(total);
        for (index, chunk) in packet.chunks(budget).enumerate() {
            let frame_type = if total == 1 {
                FrameType::End
            } else if index == 0 {
                FrameType::Start
            } else if index == total - 1 {
                FrameType::End
            } else {
                FrameType::Continue
            };
            let header = FrameHeader {
                frame_type,
                sequence: index as u16,
                total: total as u16,
            };
            let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + chunk.len());
            frame.extend_from_slice(&header.encode());
            frame.extend_from_slice(chunk);
            frames.push(frame);
        }
        Ok(frames)
    }
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

/// Counters exported by a reassembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub fragments_received: u64,
    pub packets_reassembled: u64,
    pub packets_timeout: u64,
    pub pending_packets: usize,
}

impl ReassemblyStats {
    /// Sum two stat snapshots, e.g. when aggregating across peers.
    pub fn merged(self, other: Self) -> Self {
        Self {
            fragments_received: self.fragments_received + other.fragments_received,
            packets_reassembled: self.packets_reassembled + other.packets_reassembled,
            packets_timeout: self.packets_timeout + other.packets_timeout,
            pending_packets: self.pending_packets + other.pending_packets,
        }
    }
}

#[derive(Debug)]
struct PartialPacket {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
    total: u16,
    updated_at: Instant,
}

impl PartialPacket {
    fn new(total: u16, now: Instant) -> Self {
        Self {
            slots: vec![None; usize::from(total)],
            filled: 0,
            total,
            updated_at: now,
        }
    }
}

/// Rebuilds one peer's packets from its frames.
///
/// Frames of a single packet may arrive in any order; duplicates overwrite
/// their slot and are otherwise idempotent. A frame whose `total` differs
/// from the in-progress packet abandons the stale partial, since a sender
/// never interleaves frames of two packets on one link.
#[derive(Debug)]
pub struct Reassembler {
    timeout: Duration,
    partial: Option<PartialPacket>,
    fragments_received: u64,
    packets_reassembled: u64,
    packets_timeout: u64,
}

impl Reassembler {
    /// Create a reassembler whose partial buffers expire after `timeout`
    /// without a new frame.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            partial: None,
            fragments_received: 0,
            packets_reassembled: 0,
            packets_timeout: 0,
        }
    }

    /// Accept one frame, returning the completed packet once all slots fill.
    pub fn accept(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        self.accept_at(frame, Instant::now())
    }

    /// [`Self::accept`] with an explicit clock, for deterministic sweeps.
    pub fn accept_at(
        &mut self,
        frame: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, FragmentError> {
        let header = FrameHeader::decode(frame)?;
        let payload = &frame[FRAME_HEADER_LEN..];
        if payload.is_empty() {
            return Err(FragmentError::MalformedFrame {
                reason: "empty frame payload",
            });
        }
        if header.total == 0 {
            return Err(FragmentError::MalformedFrame {
                reason: "zero frame total",
            });
        }
        if header.sequence >= header.total {
            return Err(FragmentError::MalformedFrame {
                reason: "sequence outside frame total",
            });
        }
        self.fragments_received += 1;

        // A frame announcing a different total belongs to a new packet; the
        // old partial is unrecoverable.
        let stale = self
            .partial
            .as_ref()
            .is_some_and(|partial| partial.total != header.total);
        if stale {
            self.partial = None;
        }
        let partial = self
            .partial
            .get_or_insert_with(|| PartialPacket::new(header.total, now));

        let slot = usize::from(header.sequence);
        if partial.slots[slot].is_none() {
            partial.filled += 1;
        }
        partial.slots[slot] = Some(payload.to_vec());
        partial.updated_at = now;

        if partial.filled == usize::from(partial.total) {
            let Some(complete) = self.partial.take() else {
                return Ok(None);
            };
            let size = complete
                .slots
                .iter()
                .map(|slot| slot.as_ref().map_or(0, Vec::len))
                .sum();
            let mut packet = Vec::with_capacity(size);
            for payload in complete.slots.into_iter().flatten() {
                packet.extend_from_slice(&payload);
            }
            self.packets_reassembled += 1;
            return Ok(Some(packet));
        }
        Ok(None)
    }

    /// Discard a partial packet that has not seen a frame within the timeout.
    /// Returns the number of buffers discarded and bumps `packets_timeout`.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`Self::sweep`] with an explicit clock.
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let expired = self
            .partial
            .as_ref()
            .is_some_and(|partial| now.saturating_duration_since(partial.updated_at) > self.timeout);
        if expired {
            self.partial = None;
            self.packets_timeout += 1;
            1
        } else {
            0
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ReassemblyStats {
        ReassemblyStats {
            fragments_received: self.fragments_received,
            packets_reassembled: self.packets_reassembled,
            packets_timeout: self.packets_timeout,
            pending_packets: usize::from(self.partial.is_some()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
