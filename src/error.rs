//! Error types for the recovery core.
//!
//! The core has no recoverable error domain of its own; its inputs come from
//! already-validated parsers. These variants classify programming faults in
//! the surrounding stack. The detector logs them and leaves its state
//! untouched; the caller decides whether they are connection-fatal.

use crate::types::PacketNumber;
use thiserror::Error;

/// Faults observable at the recovery entry points.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A packet-sent notification did not advance the packet number
    /// sequence (duplicate or reordered send notification).
    #[error("packet number {0} does not advance the send sequence")]
    PacketNumberRegression(PacketNumber),

    /// An ACK frame acknowledged a packet number that was never sent.
    #[error("ack frame acknowledges unsent packet number {0}")]
    AckBeyondLargestSent(PacketNumber),

    /// A frame other than ACK reached the frame handler.
    #[error("unexpected frame type {0:#04x}")]
    UnexpectedFrame(u8),

    /// An event arrived after shutdown.
    #[error("loss detector is shut down")]
    ShutDown,
}

/// Result alias for recovery operations.
pub type Result<T> = core::result::Result<T, Error>;
