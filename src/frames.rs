//! # ACK Frame Model
//!
//! The parsed shape of the ACK frames the recovery core consumes, plus the
//! expansion of the run-length-encoded block section into individual packet
//! numbers. Wire parsing and serialization live with the packet layer; this
//! module only defines what arrives here already parsed.

#![forbid(unsafe_code)]

use crate::types::PacketNumber;
use tinyvec::TinyVec;

/// Frame Type Constants
///
/// The first byte of each frame identifies its type.
pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_PING: u8 = 0x01;
pub const FRAME_TYPE_ACK: u8 = 0x02;

/// Frames visible to the recovery layer.
///
/// The loss detector registers interest in ACK frames only; the other
/// variants exist so misrouted frames can be identified and rejected.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Acknowledgement of received packets
    Ack(AckFrame),
    /// PING frame (ack-eliciting, no payload)
    Ping,
    /// PADDING frame
    Padding,
}

impl Frame {
    /// Wire type identifier for this frame.
    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Ack(_) => FRAME_TYPE_ACK,
            Frame::Ping => FRAME_TYPE_PING,
            Frame::Padding => FRAME_TYPE_PADDING,
        }
    }
}

/// ACK Frame
///
/// Describes a descending run of `first_ack_block_length + 1` acknowledged
/// packet numbers starting at `largest_acknowledged`, followed by
/// alternating gaps and further blocks.
#[derive(Debug, Clone)]
pub struct AckFrame {
    /// Largest packet number being acknowledged
    pub largest_acknowledged: PacketNumber,

    /// Delay, in milliseconds, the peer held this ACK after receiving
    /// the largest acknowledged packet
    pub ack_delay: u64,

    /// Number of packets acknowledged immediately below
    /// `largest_acknowledged`, in addition to it
    pub first_ack_block_length: u64,

    /// Additional (gap, length) blocks, in descending packet-number order
    pub ack_blocks: TinyVec<[AckBlock; 8]>,
}

/// One gap/block pair of an ACK frame's block section.
///
/// `gap + 1` packet numbers are skipped, then `length + 1` packet numbers
/// are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBlock {
    /// Unacknowledged packet numbers before this block, minus one
    pub gap: u64,

    /// Acknowledged packet numbers in this block, minus one
    pub length: u64,
}

impl AckFrame {
    /// ACK of a single packet number with the given delay.
    pub fn single(packet_number: PacketNumber, ack_delay: u64) -> Self {
        Self {
            largest_acknowledged: packet_number,
            ack_delay,
            first_ack_block_length: 0,
            ack_blocks: TinyVec::default(),
        }
    }

    /// Expand the block section into the acknowledged packet numbers,
    /// descending from `largest_acknowledged`.
    ///
    /// A block section that would descend below packet number zero ends
    /// the expansion there rather than wrapping.
    pub fn acked_packet_numbers(&self) -> AckedPacketNumbers<'_> {
        AckedPacketNumbers {
            frame: self,
            cursor: Some(self.largest_acknowledged),
            run_remaining: self.first_ack_block_length.saturating_add(1),
            block_index: 0,
        }
    }
}

/// Iterator over the packet numbers an [`AckFrame`] acknowledges.
#[derive(Debug)]
pub struct AckedPacketNumbers<'a> {
    frame: &'a AckFrame,
    /// Next packet number to emit, None once the descent hit zero
    cursor: Option<PacketNumber>,
    /// Numbers left to emit in the current run, including `cursor`
    run_remaining: u64,
    block_index: usize,
}

impl Iterator for AckedPacketNumbers<'_> {
    type Item = PacketNumber;

    fn next(&mut self) -> Option<PacketNumber> {
        loop {
            if self.run_remaining > 0 {
                let pn = self.cursor?;
                self.run_remaining -= 1;
                self.cursor = pn.checked_sub(1);
                return Some(pn);
            }

            let block = self.frame.ack_blocks.get(self.block_index)?;
            self.block_index += 1;

            // Skip gap + 1 numbers below the previous run; cursor already
            // sits one below the last emitted number.
            let cur = self.cursor?;
            self.cursor = block.gap.checked_add(1).and_then(|skip| cur.checked_sub(skip));
            self.run_remaining = block.length.saturating_add(1);
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
