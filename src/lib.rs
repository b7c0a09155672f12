//! # quic-recovery: QUIC Loss Detection and Retransmission Timing
//!
//! The loss-detection core of a QUIC transport endpoint, following the
//! transport draft's loss-detection pseudocode: given packet-sent
//! notifications and inbound ACK frames, it decides which in-flight packets
//! are lost, maintains the smoothed RTT estimate, and schedules the single
//! timer that drives handshake retransmission, early/time-based loss
//! detection, tail loss probes, and retransmission timeouts.
//!
//! This crate tracks one packet number space per connection (the draft-era
//! model). Packet construction, wire parsing, congestion-control policy,
//! and sockets all live behind trait seams or outside the crate entirely.
//!
//! ## Architecture Overview
//!
//! ```text
//! quic-recovery/
//! ├── error          - Fault classification for the entry points
//! ├── types          - Packet numbers, nanosecond monotonic Instant
//! ├── config         - Detection mode and tuning constants
//! ├── frames         - ACK frame model and block-section expansion
//! ├── recovery       - RTT estimator, loss detector, trait seams
//! └── actor          - Single-owner tokio event loop and periodic tick
//! ```
//!
//! ## Design Principles
//!
//! 1. **Pure State Machine**: [`recovery::LossDetector`] performs no I/O and
//!    reads no clock; every operation takes an explicit monotonic `now`.
//!
//! 2. **Single Owner**: the [`actor`] module serializes packet-sent, frame,
//!    and tick events onto one task, replacing lock ordering with message
//!    ordering.
//!
//! 3. **Deterministic**: state transitions depend only on inputs and the
//!    supplied time, which keeps every timer scenario unit-testable.
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use quic_recovery::{actor, LossDetector, LossDetectionConfig};
//!
//! let detector = LossDetector::new(transmitter, congestion, LossDetectionConfig::default());
//! let (handle, task) = actor::spawn(detector);
//!
//! // From the send path:
//! handle.on_packet_sent(packet_number, true, false, size, payload)?;
//!
//! // From the receive path:
//! handle.handle_frame(Frame::Ack(ack))?;
//! ```

#![forbid(unsafe_code)]

/// Single-owner event loop driving a detector on a tokio runtime
pub mod actor;

/// Loss detection configuration and protocol constants
pub mod config;

/// Fault classification for the recovery entry points
pub mod error;

/// ACK frame model and block-section expansion
pub mod frames;

/// RTT estimation, loss detection, and the trait seams they drive
pub mod recovery;

/// Packet numbers and the monotonic time abstraction
pub mod types;

pub use actor::LossDetectorHandle;
pub use config::{DetectionMode, LossDetectionConfig};
pub use error::{Error, Result};
pub use frames::{AckBlock, AckFrame, Frame};
pub use recovery::{
    CongestionController, DetectorStats, LossDetector, PacketTransmitter, RttEstimator,
    SentPacket,
};
pub use types::{Instant, PacketNumber};
