//! Loss detection configuration.
//!
//! Tuning constants follow the transport draft's loss-detection section.
//! The reordering mode is fixed at construction for the lifetime of the
//! connection: count-based reordering tolerates a packet-number gap, time-
//! based reordering tolerates an RTT fraction, and each mode disables the
//! other's threshold entirely.

#![forbid(unsafe_code)]

use core::time::Duration;
use serde::{Deserialize, Serialize};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Maximum number of tail loss probes before falling back to RTO
pub const MAX_TLPS: u32 = 2;

/// Maximum reordering in packet numbers before an older packet is
/// declared lost (count-based mode)
pub const REORDERING_THRESHOLD: u64 = 3;

/// Maximum reordering in time, as a fraction of RTT (time-based mode)
pub const TIME_REORDERING_FRACTION: f64 = 1.0 / 8.0;

/// Minimum tail loss probe timeout
pub const MIN_TLP_TIMEOUT: Duration = Duration::from_millis(10);

/// Minimum retransmission timeout
pub const MIN_RTO_TIMEOUT: Duration = Duration::from_millis(200);

/// Assumed peer delayed-ACK timeout, folded into the TLP timer
pub const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(25);

/// RTT estimate used before the first sample
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(100);

/// Granularity of the periodic alarm-polling tick
pub const ALARM_GRANULARITY: Duration = Duration::from_millis(25);

// ============================================================================
// Configuration
// ============================================================================

/// Reordering-loss mode, fixed for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Declare loss when `reordering_threshold` newer packets are acked
    CountBased,
    /// Declare loss when a packet outlives an RTT-scaled time threshold
    TimeBased,
}

/// Loss detection configuration.
///
/// Defaults are the draft's recommended values. Serde support follows the
/// rest of the stack's configuration layer: unknown fields rejected at a
/// higher level, missing fields filled from `Default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossDetectionConfig {
    /// Reordering mode (count-based or time-based)
    pub mode: DetectionMode,

    /// Tail loss probes before RTO
    pub max_tlps: u32,

    /// Packet-number reordering tolerance (count-based mode)
    pub reordering_threshold: u64,

    /// Time reordering tolerance as an RTT fraction (time-based mode)
    pub time_reordering_fraction: f64,

    /// Floor for the TLP timer
    pub min_tlp_timeout: Duration,

    /// Floor for the RTO timer
    pub min_rto_timeout: Duration,

    /// Peer delayed-ACK allowance folded into the TLP timer
    pub delayed_ack_timeout: Duration,

    /// RTT assumed for handshake retransmission before any sample
    pub default_initial_rtt: Duration,
}

impl Default for LossDetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::CountBased,
            max_tlps: MAX_TLPS,
            reordering_threshold: REORDERING_THRESHOLD,
            time_reordering_fraction: TIME_REORDERING_FRACTION,
            min_tlp_timeout: MIN_TLP_TIMEOUT,
            min_rto_timeout: MIN_RTO_TIMEOUT,
            delayed_ack_timeout: DELAYED_ACK_TIMEOUT,
            default_initial_rtt: DEFAULT_INITIAL_RTT,
        }
    }
}

impl LossDetectionConfig {
    /// Packet-number reordering threshold in effect, None when the mode
    /// disables count-based loss.
    pub fn packet_threshold(&self) -> Option<u64> {
        match self.mode {
            DetectionMode::CountBased => Some(self.reordering_threshold),
            DetectionMode::TimeBased => None,
        }
    }

    /// Time reordering fraction in effect, None when the mode disables
    /// time-based loss.
    pub fn time_fraction(&self) -> Option<f64> {
        match self.mode {
            DetectionMode::CountBased => None,
            DetectionMode::TimeBased => Some(self.time_reordering_fraction),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.time_reordering_fraction <= 0.0 || !self.time_reordering_fraction.is_finite() {
            errors.push(format!(
                "time_reordering_fraction must be a positive finite value, got {}",
                self.time_reordering_fraction
            ));
        }
        if self.default_initial_rtt.is_zero() {
            errors.push("default_initial_rtt must be non-zero".to_string());
        }
        if self.min_rto_timeout < self.min_tlp_timeout {
            errors.push(format!(
                "min_rto_timeout ({:?}) must not be below min_tlp_timeout ({:?})",
                self.min_rto_timeout, self.min_tlp_timeout
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
