//! # RTT Estimation
//!
//! Smoothed RTT and mean-deviation estimator per RFC 6298, feeding both the
//! loss thresholds and the probe timers.

#![forbid(unsafe_code)]

use core::time::Duration;

/// RTT estimator.
///
/// `smoothed_rtt` stays at zero until the first sample arrives; the alarm
/// code substitutes the configured initial RTT while it is zero.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// Most recent sample
    latest_rtt: Duration,

    /// Exponentially weighted moving average of samples
    smoothed_rtt: Duration,

    /// Mean deviation of samples
    rttvar: Duration,
}

impl RttEstimator {
    /// Create an estimator with no samples taken.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one RTT sample.
    ///
    /// The sample must already have the peer's ack delay removed. The first
    /// sample seeds the estimator directly; later samples blend in with
    /// 1/8 (mean) and 1/4 (deviation) gains. The multiplications happen
    /// before the divisions so the integer math keeps the intended weights.
    pub fn update(&mut self, sample: Duration) {
        self.latest_rtt = sample;

        if self.smoothed_rtt.is_zero() {
            self.smoothed_rtt = sample;
            self.rttvar = sample / 2;
        } else {
            let deviation = if self.smoothed_rtt > sample {
                self.smoothed_rtt - sample
            } else {
                sample - self.smoothed_rtt
            };
            self.rttvar = (self.rttvar * 3 + deviation) / 4;
            self.smoothed_rtt = (self.smoothed_rtt * 7 + sample) / 8;
        }
    }

    /// Most recent sample, zero before the first.
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Smoothed RTT, zero before the first sample.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    /// Mean deviation of samples.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Whether at least one sample has been taken.
    pub fn has_sample(&self) -> bool {
        !self.smoothed_rtt.is_zero()
    }

    /// The larger of the latest sample and the smoothed estimate, the base
    /// for time-threshold loss delays.
    pub fn max_rtt(&self) -> Duration {
        self.latest_rtt.max(self.smoothed_rtt)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
