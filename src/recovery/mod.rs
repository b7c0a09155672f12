//! # Loss Detection and Retransmission Timing
//!
//! The recovery subsystem decides which in-flight packets are lost, when to
//! arm the single retransmission timer, and how to maintain the smoothed RTT
//! estimate those decisions share. It follows the transport draft's
//! loss-detection pseudocode: reordering-threshold loss, time-threshold loss,
//! and the handshake/TLP/RTO probe ladder all drive one alarm slot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Connection / Actor            │
//! └────────────────┬────────────────────────┘
//!                  │ Events: packet sent, ACK frame, timer tick
//!                  ▼
//! ┌─────────────────────────────────────────┐
//! │             LossDetector                 │
//! ├─────────────────────────────────────────┤
//! │ • In-flight bookkeeping (SentPackets)    │
//! │ • RTT estimator                          │
//! │ • Loss classification + alarm scheduling │
//! └────┬────────────────────┬────────────────┘
//!      │ probes              │ lost packets
//!      ▼                    ▼
//! ┌─────────────┐    ┌──────────────────┐
//! │ Transmitter │    │Congestion Control│
//! │  (Trait)    │    │     (Trait)      │
//! └─────────────┘    └──────────────────┘
//! ```
//!
//! The transmitter and congestion controller are trait seams: the detector
//! never builds packets or adjusts a window itself.

#![forbid(unsafe_code)]

use crate::types::PacketNumber;
use bytes::Bytes;
use std::collections::BTreeSet;

pub mod detector;
pub mod rtt;

pub use detector::{DetectorStats, LossDetector, SentPacket};
pub use rtt::RttEstimator;

// ============================================================================
// Trait: Packet Transmitter
// ============================================================================

/// The packet transmitter the detector drives for probes and handshake
/// retransmission.
///
/// Implementations build, number, serialize and queue packets for the wire.
/// The detector only ever asks for "one new packet" or "these frames again
/// under a new number".
pub trait PacketTransmitter {
    /// Transmit a new packet if data is available.
    ///
    /// Returns the number of packets actually queued (0 if nothing to send).
    fn transmit_new_packet(&mut self) -> u32;

    /// Rebuild the retransmittable frames of a prior packet as a new packet
    /// under a new packet number and queue it for the wire.
    ///
    /// The payload is the opaque handle recorded when the original packet
    /// was sent; ACK and PADDING frames are not carried over.
    fn retransmit(&mut self, payload: Bytes);
}

// ============================================================================
// Trait: Congestion Controller
// ============================================================================

/// The congestion-control surface the detector reports into.
///
/// The controller decides whether lost packets are retransmitted
/// immediately; the detector itself never retransmits on reordering loss.
pub trait CongestionController {
    /// Packets declared lost by the detector.
    ///
    /// Called at most once per detection pass, and only with a non-empty
    /// set. Runs on the detector's event path and must not call back into
    /// the detector.
    fn on_packets_lost(&mut self, lost: &BTreeSet<PacketNumber>);

    /// After a retransmission timeout, an acknowledgement arrived for a
    /// packet number above the largest sent before the timeout fired.
    ///
    /// The default does nothing; controllers that react to the timeout
    /// verdict hook in here.
    fn on_retransmission_timeout_verified(&mut self) {}
}
