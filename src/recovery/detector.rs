//! # Loss Detector
//!
//! In-flight bookkeeping, loss classification, and alarm scheduling for one
//! connection. Three mechanisms share the single alarm slot, in priority
//! order: handshake retransmission, early/time-based loss detection, and the
//! TLP/RTO probe ladder. A periodic tick polls the armed deadline; the
//! deadline may only be pulled earlier within a scheduling step and is
//! drained when it fires.

#![forbid(unsafe_code)]

use crate::config::LossDetectionConfig;
use crate::error::{Error, Result};
use crate::frames::{AckFrame, Frame, FRAME_TYPE_ACK};
use crate::recovery::rtt::RttEstimator;
use crate::recovery::{CongestionController, PacketTransmitter};
use crate::types::{Instant, PacketNumber};
use bytes::Bytes;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

// ============================================================================
// In-Flight Bookkeeping
// ============================================================================

/// Record kept for each sent packet until it is acked, declared lost, or
/// retransmitted as part of handshake recovery.
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Packet number, unique within the connection
    pub packet_number: PacketNumber,

    /// When the packet was handed to the transmitter
    pub time_sent: Instant,

    /// Carried at least one frame other than ACK/PADDING
    pub retransmittable: bool,

    /// Belongs to the cryptographic handshake (Initial or Handshake
    /// long-header packet; Retry does not qualify)
    pub handshake: bool,

    /// Wire bytes
    pub size: usize,

    /// Opaque handle the transmitter uses to rebuild the packet's
    /// retransmittable frames under a new packet number
    pub payload: Bytes,
}

/// Read-only snapshot of detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorStats {
    pub largest_sent_packet: PacketNumber,
    pub largest_acked_packet: PacketNumber,
    pub unacked_packets: usize,
    pub handshake_outstanding: u32,
    pub retransmittable_outstanding: u32,
    pub handshake_count: u32,
    pub tlp_count: u32,
    pub rto_count: u32,
    pub latest_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub rttvar: Duration,
    pub time_of_last_sent_packet: Option<Instant>,
    pub loss_time: Option<Instant>,
    pub alarm_deadline: Option<Instant>,
}

// ============================================================================
// Loss Detector
// ============================================================================

/// Loss detection and retransmission timing for one connection.
///
/// The detector owns its transmitter and congestion-controller seams and is
/// driven with an explicit monotonic `now`; it performs no I/O and reads no
/// clock of its own. All operations are synchronous and bounded: linear in
/// the number of in-flight packets for loss detection, linear in ACK blocks
/// for range expansion.
pub struct LossDetector<T, C> {
    transmitter: T,
    congestion: C,
    config: LossDetectionConfig,

    /// Packet-number reordering tolerance; None in time-based mode
    reordering_threshold: Option<u64>,
    /// RTT-fraction reordering tolerance; None in count-based mode
    time_reordering_fraction: Option<f64>,

    /// In-flight packets, ascending by packet number
    sent_packets: BTreeMap<PacketNumber, SentPacket>,
    rtt: RttEstimator,

    /// Largest packet number handed to the transmitter; 0 = none yet
    largest_sent_packet: PacketNumber,
    /// Largest packet number ever acknowledged; 0 = none yet
    largest_acked_packet: PacketNumber,
    /// Snapshot taken when the first RTO of a run fires
    largest_sent_before_rto: PacketNumber,
    time_of_last_sent_packet: Option<Instant>,

    handshake_count: u32,
    tlp_count: u32,
    rto_count: u32,

    handshake_outstanding: u32,
    retransmittable_outstanding: u32,

    /// Earliest time the oldest undecided packet becomes losable by the
    /// time threshold
    loss_time: Option<Instant>,
    /// Armed alarm deadline; None when nothing retransmittable is in flight
    alarm_at: Option<Instant>,

    shut_down: bool,
}

impl<T, C> LossDetector<T, C>
where
    T: PacketTransmitter,
    C: CongestionController,
{
    /// Create a detector for a new connection.
    ///
    /// The reordering mode in `config` is fixed for the connection's
    /// lifetime: each mode disables the other mechanism's threshold.
    pub fn new(transmitter: T, congestion: C, config: LossDetectionConfig) -> Self {
        let reordering_threshold = config.packet_threshold();
        let time_reordering_fraction = config.time_fraction();
        Self {
            transmitter,
            congestion,
            config,
            reordering_threshold,
            time_reordering_fraction,
            sent_packets: BTreeMap::new(),
            rtt: RttEstimator::new(),
            largest_sent_packet: 0,
            largest_acked_packet: 0,
            largest_sent_before_rto: 0,
            time_of_last_sent_packet: None,
            handshake_count: 0,
            tlp_count: 0,
            rto_count: 0,
            handshake_outstanding: 0,
            retransmittable_outstanding: 0,
            loss_time: None,
            alarm_at: None,
            shut_down: false,
        }
    }

    /// Frame types this component consumes.
    pub fn interests() -> &'static [u8] {
        &[FRAME_TYPE_ACK]
    }

    /// Largest packet number ever acknowledged by the peer.
    pub fn largest_acked_packet_number(&self) -> PacketNumber {
        self.largest_acked_packet
    }

    /// Armed alarm deadline, if any. A deadline implies the periodic tick
    /// must be running.
    pub fn alarm_deadline(&self) -> Option<Instant> {
        self.alarm_at
    }

    /// Snapshot of the detector's state.
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            largest_sent_packet: self.largest_sent_packet,
            largest_acked_packet: self.largest_acked_packet,
            unacked_packets: self.sent_packets.len(),
            handshake_outstanding: self.handshake_outstanding,
            retransmittable_outstanding: self.retransmittable_outstanding,
            handshake_count: self.handshake_count,
            tlp_count: self.tlp_count,
            rto_count: self.rto_count,
            latest_rtt: self.rtt.latest_rtt(),
            smoothed_rtt: self.rtt.smoothed_rtt(),
            rttvar: self.rtt.rttvar(),
            time_of_last_sent_packet: self.time_of_last_sent_packet,
            loss_time: self.loss_time,
            alarm_deadline: self.alarm_at,
        }
    }

    // ------------------------------------------------------------------------
    // Packet-sent path
    // ------------------------------------------------------------------------

    /// Record a packet handed to the transmitter.
    ///
    /// Packet numbers must arrive in send order; a number that does not
    /// advance the sequence is a fault in the caller and is logged and
    /// ignored. Non-retransmittable packets are tracked but neither arm nor
    /// extend the alarm.
    pub fn on_packet_sent(
        &mut self,
        packet_number: PacketNumber,
        retransmittable: bool,
        handshake: bool,
        size: usize,
        payload: Bytes,
        now: Instant,
    ) -> Result<()> {
        if self.shut_down {
            return Err(Error::ShutDown);
        }
        if packet_number <= self.largest_sent_packet {
            warn!(
                packet_number,
                largest_sent = self.largest_sent_packet,
                "packet-sent notification does not advance the sequence, ignoring"
            );
            return Err(Error::PacketNumberRegression(packet_number));
        }

        self.largest_sent_packet = packet_number;
        self.time_of_last_sent_packet = Some(now);
        self.sent_packets.insert(
            packet_number,
            SentPacket {
                packet_number,
                time_sent: now,
                retransmittable,
                handshake,
                size,
                payload,
            },
        );
        if handshake {
            self.handshake_outstanding += 1;
        }
        if retransmittable {
            self.retransmittable_outstanding += 1;
            self.set_loss_detection_alarm(now);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // ACK-received path
    // ------------------------------------------------------------------------

    /// Dispatch a frame routed to this component.
    ///
    /// Only ACK frames are consumed here; anything else is a routing fault.
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Result<()> {
        if self.shut_down {
            return Err(Error::ShutDown);
        }
        match frame {
            Frame::Ack(ack) => self.on_ack_received(ack, now),
            other => {
                error!(
                    frame_type = other.frame_type(),
                    "unexpected frame type routed to loss detection"
                );
                Err(Error::UnexpectedFrame(other.frame_type()))
            }
        }
    }

    /// Process a parsed ACK frame.
    pub fn on_ack_received(&mut self, ack: &AckFrame, now: Instant) -> Result<()> {
        if self.shut_down {
            return Err(Error::ShutDown);
        }
        if ack.largest_acknowledged > self.largest_sent_packet {
            warn!(
                largest_acknowledged = ack.largest_acknowledged,
                largest_sent = self.largest_sent_packet,
                "ack frame acknowledges an unsent packet, ignoring"
            );
            return Err(Error::AckBeyondLargestSent(ack.largest_acknowledged));
        }

        self.largest_acked_packet = self.largest_acked_packet.max(ack.largest_acknowledged);

        // RTT sample, only when the largest acked is newly seen in flight.
        // ack_delay is carried in milliseconds on the wire; it becomes
        // nanoseconds here and never mixes back in.
        if let Some(info) = self.sent_packets.get(&ack.largest_acknowledged) {
            let mut sample = now.saturating_duration_since(info.time_sent);
            let ack_delay = Duration::from_millis(ack.ack_delay);
            if sample > ack_delay {
                sample -= ack_delay;
            }
            self.rtt.update(sample);
        }

        debug!(
            unacked = self.sent_packets.len(),
            retransmittable = self.retransmittable_outstanding,
            handshake = self.handshake_outstanding,
            "processing ack"
        );

        for acked in ack.acked_packet_numbers() {
            self.on_packet_acked(acked);
        }

        self.detect_lost_packets(ack.largest_acknowledged, now);
        self.set_loss_detection_alarm(now);
        Ok(())
    }

    /// One newly-acked packet number. Numbers already removed by a prior
    /// ACK or loss pass are silently ignored.
    fn on_packet_acked(&mut self, acked: PacketNumber) {
        if !self.sent_packets.contains_key(&acked) {
            return;
        }
        debug!(packet_number = acked, "packet acked");
        if self.rto_count > 0 && acked > self.largest_sent_before_rto {
            self.congestion.on_retransmission_timeout_verified();
        }
        self.handshake_count = 0;
        self.tlp_count = 0;
        self.rto_count = 0;
        self.decrement_outstanding(acked);
        self.sent_packets.remove(&acked);
    }

    /// Drop the outstanding counters for a packet still present in the map.
    fn decrement_outstanding(&mut self, packet_number: PacketNumber) {
        if let Some(info) = self.sent_packets.get(&packet_number) {
            if info.handshake {
                self.handshake_outstanding -= 1;
            }
            if info.retransmittable {
                self.retransmittable_outstanding -= 1;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Loss detection
    // ------------------------------------------------------------------------

    /// Classify in-flight packets older than `largest_acked`.
    ///
    /// A packet is lost once it outlives the time threshold or falls more
    /// than the reordering threshold behind. The oldest packet that is
    /// neither schedules `loss_time`, the future instant at which it would
    /// become losable by the time rule.
    fn detect_lost_packets(&mut self, largest_acked: PacketNumber, now: Instant) {
        self.loss_time = None;
        let mut lost_packets = BTreeSet::new();

        let delay_until_lost: Option<Duration> = if let Some(fraction) =
            self.time_reordering_fraction
        {
            Some(self.rtt.max_rtt().mul_f64(1.0 + fraction))
        } else if largest_acked == self.largest_sent_packet {
            // Early retransmit: nothing newer is in flight, so only time can
            // decide the stragglers below the largest acked.
            Some(self.rtt.max_rtt() * 9 / 8)
        } else {
            None
        };

        for (packet_number, info) in self.sent_packets.range(..largest_acked) {
            let time_since_sent = now.saturating_duration_since(info.time_sent);
            let packet_delta = largest_acked - packet_number;

            let time_lost = delay_until_lost.is_some_and(|delay| time_since_sent > delay);
            let count_lost = self
                .reordering_threshold
                .is_some_and(|threshold| packet_delta > threshold);

            if time_lost || count_lost {
                lost_packets.insert(*packet_number);
            } else if self.loss_time.is_none() {
                if let Some(delay) = delay_until_lost {
                    self.loss_time = Some(now.saturating_add(delay - time_since_sent));
                }
            }
        }

        // The congestion controller decides whether lost packets are
        // retransmitted immediately; reordering loss never retransmits here.
        if !lost_packets.is_empty() {
            debug!(lost = lost_packets.len(), "packets declared lost");
            self.congestion.on_packets_lost(&lost_packets);
            for packet_number in &lost_packets {
                self.decrement_outstanding(*packet_number);
                self.sent_packets.remove(packet_number);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Alarm scheduling
    // ------------------------------------------------------------------------

    /// Re-evaluate the single alarm slot.
    ///
    /// Within one scheduling step the deadline may be pulled earlier, never
    /// pushed later. With nothing retransmittable in flight the alarm is
    /// cleared outright.
    fn set_loss_detection_alarm(&mut self, now: Instant) {
        if self.retransmittable_outstanding == 0 {
            if self.alarm_at.take().is_some() {
                debug!("loss detection alarm unset");
            }
            return;
        }

        let duration = self.alarm_duration(now);
        let target = now.saturating_add(duration);
        self.alarm_at = Some(match self.alarm_at {
            Some(current) => current.min(target),
            None => target,
        });
        debug!(duration_us = duration.as_micros() as u64, "loss detection alarm set");
    }

    /// Alarm duration implied by the current state; pure.
    ///
    /// Priority: handshake retransmission, then time-based loss, then TLP,
    /// then RTO. Matches the firing priority in
    /// [`on_loss_detection_alarm`](Self::on_loss_detection_alarm).
    fn alarm_duration(&self, now: Instant) -> Duration {
        if self.handshake_outstanding > 0 {
            let base = if self.rtt.has_sample() {
                2 * self.rtt.smoothed_rtt()
            } else {
                2 * self.config.default_initial_rtt
            };
            return base
                .max(self.config.min_tlp_timeout)
                .saturating_mul(2u32.saturating_pow(self.handshake_count));
        }

        if let Some(loss_time) = self.loss_time {
            // Zero when already due; the next tick then fires immediately.
            return loss_time.saturating_duration_since(now);
        }

        if self.tlp_count < self.config.max_tlps {
            let srtt = self.rtt.smoothed_rtt();
            return (srtt * 3 / 2 + self.config.delayed_ack_timeout)
                .max(2 * srtt)
                .max(self.config.min_tlp_timeout);
        }

        (self.rtt.smoothed_rtt() + 4 * self.rtt.rttvar())
            .max(self.config.min_rto_timeout)
            .saturating_mul(2u32.saturating_pow(self.rto_count))
    }

    // ------------------------------------------------------------------------
    // Alarm firing
    // ------------------------------------------------------------------------

    /// Poll the armed deadline against the current time.
    ///
    /// The tick is coarser than the deadline and may be late; firing drains
    /// the deadline so the post-action re-arm starts from a clean slot.
    pub fn on_timer_tick(&mut self, now: Instant) {
        if self.shut_down {
            return;
        }
        match self.alarm_at {
            Some(deadline) if deadline <= now => {
                self.alarm_at = None;
                self.on_loss_detection_alarm(now);
            }
            _ => {}
        }
    }

    fn on_loss_detection_alarm(&mut self, now: Instant) {
        if self.handshake_outstanding > 0 {
            debug!("handshake retransmission alarm");
            self.retransmit_handshake_packets();
            self.handshake_count += 1;
        } else if self.loss_time.is_some() {
            // Early retransmit or time loss detection.
            self.detect_lost_packets(self.largest_acked_packet, now);
        } else if self.tlp_count < self.config.max_tlps {
            debug!("tail loss probe");
            self.send_one_packet();
            self.tlp_count += 1;
        } else {
            if self.rto_count == 0 {
                self.largest_sent_before_rto = self.largest_sent_packet;
            }
            debug!("retransmission timeout");
            self.send_two_packets();
            self.rto_count += 1;
        }
        debug!(
            unacked = self.sent_packets.len(),
            retransmittable = self.retransmittable_outstanding,
            handshake = self.handshake_outstanding,
            "in-flight after alarm"
        );
        self.set_loss_detection_alarm(now);
    }

    // ------------------------------------------------------------------------
    // Probe actions
    // ------------------------------------------------------------------------

    /// Hand every in-flight handshake packet back to the transmitter and
    /// drop it from the map. Handshake packets occupy the low end of the
    /// sequence; the scan stops at the first non-handshake entry.
    fn retransmit_handshake_packets(&mut self) {
        let mut retransmitted = Vec::new();
        for (packet_number, info) in self.sent_packets.iter() {
            if !info.handshake {
                break;
            }
            retransmitted.push(*packet_number);
            self.transmitter.retransmit(info.payload.clone());
        }
        for packet_number in retransmitted {
            self.decrement_outstanding(packet_number);
            self.sent_packets.remove(&packet_number);
        }
    }

    /// One probe: a new packet if the transmitter has one, otherwise the
    /// most recently sent packet again.
    fn send_one_packet(&mut self) {
        if self.transmitter.transmit_new_packet() < 1 {
            if let Some(info) = self.sent_packets.values().next_back() {
                self.transmitter.retransmit(info.payload.clone());
            }
        }
    }

    /// Two probes for RTO: the two most recently sent packets, or one new
    /// packet when nothing is in flight anymore.
    fn send_two_packets(&mut self) {
        let mut newest_first = self.sent_packets.values().rev();
        match newest_first.next() {
            Some(first) => {
                self.transmitter.retransmit(first.payload.clone());
                if let Some(second) = newest_first.next() {
                    self.transmitter.retransmit(second.payload.clone());
                }
            }
            None => {
                self.transmitter.transmit_new_packet();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Cancel the alarm and release all in-flight state. Subsequent events
    /// are no-ops.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        debug!("loss detector shutdown");
        self.shut_down = true;
        self.alarm_at = None;
        self.loss_time = None;
        self.sent_packets.clear();
        self.handshake_outstanding = 0;
        self.retransmittable_outstanding = 0;
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionMode;
    use std::cell::RefCell;
    use std::rc::Rc;

    // ------------------------------------------------------------------------
    // Mock collaborators
    // ------------------------------------------------------------------------

    #[derive(Debug, Default)]
    struct TransmitterState {
        new_packets_available: u32,
        transmitted_new: u32,
        retransmitted: Vec<Bytes>,
    }

    #[derive(Clone, Default)]
    struct MockTransmitter(Rc<RefCell<TransmitterState>>);

    impl PacketTransmitter for MockTransmitter {
        fn transmit_new_packet(&mut self) -> u32 {
            let mut state = self.0.borrow_mut();
            if state.new_packets_available > 0 {
                state.new_packets_available -= 1;
                state.transmitted_new += 1;
                1
            } else {
                0
            }
        }

        fn retransmit(&mut self, payload: Bytes) {
            self.0.borrow_mut().retransmitted.push(payload);
        }
    }

    #[derive(Debug, Default)]
    struct CongestionState {
        lost_batches: Vec<BTreeSet<PacketNumber>>,
        rto_verified: u32,
    }

    #[derive(Clone, Default)]
    struct MockCongestion(Rc<RefCell<CongestionState>>);

    impl CongestionController for MockCongestion {
        fn on_packets_lost(&mut self, lost: &BTreeSet<PacketNumber>) {
            assert!(!lost.is_empty(), "lost set must be non-empty");
            self.0.borrow_mut().lost_batches.push(lost.clone());
        }

        fn on_retransmission_timeout_verified(&mut self) {
            self.0.borrow_mut().rto_verified += 1;
        }
    }

    type TestDetector = LossDetector<MockTransmitter, MockCongestion>;

    struct Harness {
        detector: TestDetector,
        transmitter: MockTransmitter,
        congestion: MockCongestion,
    }

    fn harness(mode: DetectionMode) -> Harness {
        let transmitter = MockTransmitter::default();
        let congestion = MockCongestion::default();
        let config = LossDetectionConfig {
            mode,
            ..Default::default()
        };
        Harness {
            detector: LossDetector::new(transmitter.clone(), congestion.clone(), config),
            transmitter,
            congestion,
        }
    }

    fn ms(millis: u64) -> Instant {
        Instant::from_nanos(millis * 1_000_000)
    }

    fn send(h: &mut Harness, pn: PacketNumber, at: Instant) {
        h.detector
            .on_packet_sent(pn, true, false, 1200, Bytes::from_static(b"frames"), at)
            .unwrap();
    }

    fn ack_single(h: &mut Harness, pn: PacketNumber, ack_delay: u64, at: Instant) {
        h.detector
            .on_ack_received(&AckFrame::single(pn, ack_delay), at)
            .unwrap();
    }

    fn assert_invariants(h: &Harness) {
        let d = &h.detector;
        let handshake = d.sent_packets.values().filter(|p| p.handshake).count() as u32;
        let retransmittable = d
            .sent_packets
            .values()
            .filter(|p| p.retransmittable)
            .count() as u32;
        assert_eq!(d.handshake_outstanding, handshake);
        assert_eq!(d.retransmittable_outstanding, retransmittable);
        assert!(d
            .sent_packets
            .keys()
            .all(|pn| *pn <= d.largest_sent_packet));
        if d.retransmittable_outstanding == 0 {
            assert_eq!(d.alarm_at, None);
        }
    }

    // ------------------------------------------------------------------------
    // Send / ack accounting
    // ------------------------------------------------------------------------

    #[test]
    fn test_single_send_ack_takes_rtt_sample() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        assert_eq!(h.detector.stats().unacked_packets, 1);
        assert!(h.detector.alarm_deadline().is_some());

        ack_single(&mut h, 1, 5, ms(50));

        let stats = h.detector.stats();
        assert_eq!(stats.latest_rtt, Duration::from_millis(45));
        assert_eq!(stats.smoothed_rtt, Duration::from_millis(45));
        assert_eq!(stats.rttvar, Duration::from_micros(22_500));
        assert_eq!(stats.unacked_packets, 0);
        assert_eq!(stats.alarm_deadline, None);
        assert_eq!(h.detector.largest_acked_packet_number(), 1);
        assert_invariants(&h);
    }

    #[test]
    fn test_ack_delay_larger_than_rtt_does_not_underflow() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        // 40ms elapsed, peer claims 500ms of ack delay: sample stays 40ms
        ack_single(&mut h, 1, 500, ms(40));

        assert_eq!(h.detector.stats().latest_rtt, Duration::from_millis(40));
    }

    #[test]
    fn test_non_retransmittable_send_does_not_arm_alarm() {
        let mut h = harness(DetectionMode::CountBased);

        h.detector
            .on_packet_sent(1, false, false, 30, Bytes::new(), ms(0))
            .unwrap();

        assert_eq!(h.detector.alarm_deadline(), None);
        assert_eq!(h.detector.stats().unacked_packets, 1);
        assert_invariants(&h);
    }

    #[test]
    fn test_ack_of_unknown_number_is_ignored() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        send(&mut h, 2, ms(1));
        ack_single(&mut h, 1, 0, ms(10));
        // Redundant ack of 1 inside a wider frame
        let frame = AckFrame {
            largest_acknowledged: 2,
            ack_delay: 0,
            first_ack_block_length: 1,
            ack_blocks: tinyvec::TinyVec::default(),
        };
        h.detector.on_ack_received(&frame, ms(20)).unwrap();

        assert_eq!(h.detector.stats().unacked_packets, 0);
        assert_invariants(&h);
    }

    #[test]
    fn test_counters_reset_only_on_newly_acked() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        h.detector.tlp_count = 1;
        // Acks nothing that is in flight (packet 1 is, but ack only names
        // an already-removed number after we remove it first)
        ack_single(&mut h, 1, 0, ms(10));
        assert_eq!(h.detector.stats().tlp_count, 0);

        h.detector.tlp_count = 1;
        ack_single(&mut h, 1, 0, ms(20));
        // Nothing newly acked: probe counters keep their value
        assert_eq!(h.detector.stats().tlp_count, 1);
    }

    // ------------------------------------------------------------------------
    // Malformed input
    // ------------------------------------------------------------------------

    #[test]
    fn test_duplicate_packet_sent_rejected_without_state_change() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        let before = h.detector.stats();

        let err = h
            .detector
            .on_packet_sent(1, true, false, 1200, Bytes::new(), ms(5))
            .unwrap_err();
        assert_eq!(err, Error::PacketNumberRegression(1));
        assert_eq!(h.detector.stats(), before);
        assert_invariants(&h);
    }

    #[test]
    fn test_ack_beyond_largest_sent_rejected() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        let before = h.detector.stats();

        let err = h
            .detector
            .on_ack_received(&AckFrame::single(9, 0), ms(10))
            .unwrap_err();
        assert_eq!(err, Error::AckBeyondLargestSent(9));
        assert_eq!(h.detector.stats(), before);
    }

    #[test]
    fn test_non_ack_frame_rejected() {
        let mut h = harness(DetectionMode::CountBased);

        let err = h.detector.handle_frame(&Frame::Ping, ms(0)).unwrap_err();
        assert_eq!(err, Error::UnexpectedFrame(crate::frames::FRAME_TYPE_PING));
    }

    // ------------------------------------------------------------------------
    // Loss detection
    // ------------------------------------------------------------------------

    #[test]
    fn test_count_based_reordering_loss() {
        let mut h = harness(DetectionMode::CountBased);

        for pn in 1..=5 {
            send(&mut h, pn, ms(pn - 1));
        }
        // Only packet 5 acked; delta 4 > 3 loses packet 1, delta 3 spares
        // packet 2. The late arrival keeps the early-retransmit time
        // threshold above every packet's age.
        ack_single(&mut h, 5, 0, ms(30));

        let lost = h.congestion.0.borrow().lost_batches.clone();
        assert_eq!(lost, vec![BTreeSet::from([1])]);

        let remaining: Vec<_> = h.detector.sent_packets.keys().copied().collect();
        assert_eq!(remaining, vec![2, 3, 4]);
        assert_invariants(&h);
    }

    #[test]
    fn test_identical_ack_redelivery_is_idempotent() {
        let mut h = harness(DetectionMode::CountBased);

        for pn in 1..=5 {
            send(&mut h, pn, ms(pn - 1));
        }
        ack_single(&mut h, 5, 0, ms(30));
        let after_first = h.detector.stats();
        let rtt_after_first = h.detector.stats().latest_rtt;

        ack_single(&mut h, 5, 0, ms(30));

        let after_second = h.detector.stats();
        assert_eq!(after_first, after_second);
        assert_eq!(rtt_after_first, after_second.latest_rtt);
        assert_eq!(h.congestion.0.borrow().lost_batches.len(), 1);
    }

    #[test]
    fn test_ack_wins_over_loss() {
        let mut h = harness(DetectionMode::CountBased);

        for pn in 1..=5 {
            send(&mut h, pn, ms(pn - 1));
        }
        // Everything acked at once: the removal in the ack path runs before
        // the loss scan, so nothing is ever declared lost.
        let frame = AckFrame {
            largest_acknowledged: 5,
            ack_delay: 0,
            first_ack_block_length: 4,
            ack_blocks: tinyvec::TinyVec::default(),
        };
        h.detector.on_ack_received(&frame, ms(30)).unwrap();

        assert!(h.congestion.0.borrow().lost_batches.is_empty());
        assert_eq!(h.detector.stats().unacked_packets, 0);
        assert_invariants(&h);
    }

    #[test]
    fn test_time_based_loss_on_ack() {
        let mut h = harness(DetectionMode::TimeBased);

        // Seed the estimator at 40ms
        send(&mut h, 1, ms(0));
        ack_single(&mut h, 1, 0, ms(40));
        assert_eq!(h.detector.stats().smoothed_rtt, Duration::from_millis(40));

        send(&mut h, 2, ms(50));
        send(&mut h, 3, ms(55));
        // ack_delay keeps the new sample at 40ms so the threshold stays
        // (1 + 1/8) * 40 = 45ms; packet 2 is 100ms old by now
        h.detector
            .on_ack_received(&AckFrame::single(3, 55), ms(150))
            .unwrap();

        let lost = h.congestion.0.borrow().lost_batches.clone();
        assert_eq!(lost, vec![BTreeSet::from([2])]);
        assert_eq!(h.detector.stats().unacked_packets, 0);
        assert_invariants(&h);
    }

    #[test]
    fn test_early_retransmit_arms_loss_time_then_fires() {
        let mut h = harness(DetectionMode::CountBased);

        // Seed the estimator at 100ms
        send(&mut h, 1, ms(0));
        ack_single(&mut h, 1, 0, ms(100));

        send(&mut h, 2, ms(200));
        send(&mut h, 3, ms(202));
        // Largest acked == largest sent: packet 2 is undecided but young,
        // so a loss_time in the future is armed instead
        ack_single(&mut h, 3, 0, ms(210));

        let stats = h.detector.stats();
        assert_eq!(stats.unacked_packets, 1);
        let loss_time = stats.loss_time.expect("loss_time armed");
        assert!(loss_time > ms(210));
        assert_eq!(stats.alarm_deadline, Some(loss_time));
        assert!(h.congestion.0.borrow().lost_batches.is_empty());

        // Tick past the loss time: the alarm re-runs detection and packet 2
        // is now over the threshold
        h.detector.on_timer_tick(ms(310));

        let lost = h.congestion.0.borrow().lost_batches.clone();
        assert_eq!(lost, vec![BTreeSet::from([2])]);
        assert_eq!(h.detector.stats().unacked_packets, 0);
        assert_eq!(h.detector.alarm_deadline(), None);
        assert_invariants(&h);
    }

    #[test]
    fn test_loss_time_not_before_now_when_set() {
        let mut h = harness(DetectionMode::TimeBased);

        send(&mut h, 1, ms(0));
        ack_single(&mut h, 1, 0, ms(40));
        send(&mut h, 2, ms(100));
        send(&mut h, 3, ms(101));
        let now = ms(110);
        h.detector
            .on_ack_received(&AckFrame::single(3, 0), now)
            .unwrap();

        if let Some(loss_time) = h.detector.stats().loss_time {
            assert!(loss_time >= now);
        }
    }

    // ------------------------------------------------------------------------
    // Alarm scheduling
    // ------------------------------------------------------------------------

    #[test]
    fn test_alarm_pulled_earlier_never_later() {
        let mut h = harness(DetectionMode::CountBased);

        // No RTT sample yet: TLP duration is the 25ms delayed-ack allowance
        send(&mut h, 1, ms(0));
        let first = h.detector.alarm_deadline().unwrap();
        assert_eq!(first, ms(25));

        // A later send must not push the armed deadline back
        send(&mut h, 2, ms(10));
        assert_eq!(h.detector.alarm_deadline(), Some(first));
    }

    #[test]
    fn test_tlp_escalates_to_rto() {
        let mut h = harness(DetectionMode::CountBased);

        // Seed smoothed_rtt = 50ms
        send(&mut h, 1, ms(0));
        ack_single(&mut h, 1, 0, ms(50));
        assert_eq!(h.detector.stats().smoothed_rtt, Duration::from_millis(50));

        send(&mut h, 2, ms(100));
        // TLP timer: max(1.5 * 50 + 25, 2 * 50) = 100ms
        assert_eq!(h.detector.alarm_deadline(), Some(ms(200)));

        h.detector.on_timer_tick(ms(200));
        assert_eq!(h.detector.stats().tlp_count, 1);
        assert_eq!(h.transmitter.0.borrow().retransmitted.len(), 1);
        assert_eq!(h.detector.alarm_deadline(), Some(ms(300)));

        h.detector.on_timer_tick(ms(300));
        assert_eq!(h.detector.stats().tlp_count, 2);
        assert_eq!(h.transmitter.0.borrow().retransmitted.len(), 2);
        // Probes exhausted: RTO timer max(50 + 4*rttvar, 200) = 200ms
        assert_eq!(h.detector.alarm_deadline(), Some(ms(500)));

        h.detector.on_timer_tick(ms(500));
        let stats = h.detector.stats();
        assert_eq!(stats.rto_count, 1);
        assert_eq!(stats.tlp_count, 2);
        // Only one packet in flight, so the RTO pair degrades to one
        assert_eq!(h.transmitter.0.borrow().retransmitted.len(), 3);
        // Doubled on the next miss
        assert_eq!(h.detector.alarm_deadline(), Some(ms(900)));
        assert_invariants(&h);
    }

    #[test]
    fn test_tlp_prefers_new_packet_over_retransmit() {
        let mut h = harness(DetectionMode::CountBased);
        h.transmitter.0.borrow_mut().new_packets_available = 1;

        send(&mut h, 1, ms(0));
        h.detector.on_timer_tick(ms(25));

        let state = h.transmitter.0.borrow();
        assert_eq!(state.transmitted_new, 1);
        assert!(state.retransmitted.is_empty());
    }

    #[test]
    fn test_rto_retransmits_two_most_recent() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        h.detector
            .on_packet_sent(2, true, false, 1200, Bytes::from_static(b"p2"), ms(1))
            .unwrap();
        h.detector
            .on_packet_sent(3, true, false, 1200, Bytes::from_static(b"p3"), ms(2))
            .unwrap();

        // Skip straight to the RTO branch
        h.detector.tlp_count = 2;
        h.detector.alarm_at = Some(ms(10));
        h.detector.on_timer_tick(ms(10));

        let state = h.transmitter.0.borrow();
        assert_eq!(
            state.retransmitted,
            vec![Bytes::from_static(b"p3"), Bytes::from_static(b"p2")]
        );
        drop(state);
        assert_eq!(h.detector.stats().rto_count, 1);
        assert_eq!(h.detector.largest_sent_before_rto, 3);
    }

    // ------------------------------------------------------------------------
    // Spurious RTO detection
    // ------------------------------------------------------------------------

    #[test]
    fn test_ack_above_rto_snapshot_triggers_hook() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        h.detector.tlp_count = 2;
        h.detector.alarm_at = Some(ms(10));
        h.detector.on_timer_tick(ms(10));
        assert_eq!(h.detector.stats().rto_count, 1);
        assert_eq!(h.detector.largest_sent_before_rto, 1);

        // The RTO retransmission goes out under a new number and is acked
        send(&mut h, 2, ms(20));
        ack_single(&mut h, 2, 0, ms(60));

        assert_eq!(h.congestion.0.borrow().rto_verified, 1);
        assert_eq!(h.detector.stats().rto_count, 0);
    }

    #[test]
    fn test_ack_at_or_below_rto_snapshot_does_not_trigger_hook() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        h.detector.tlp_count = 2;
        h.detector.alarm_at = Some(ms(10));
        h.detector.on_timer_tick(ms(10));
        assert_eq!(h.detector.largest_sent_before_rto, 1);

        ack_single(&mut h, 1, 0, ms(60));

        assert_eq!(h.congestion.0.borrow().rto_verified, 0);
        // Counters still reset by the newly-acked packet
        assert_eq!(h.detector.stats().rto_count, 0);
    }

    // ------------------------------------------------------------------------
    // Handshake retransmission
    // ------------------------------------------------------------------------

    #[test]
    fn test_handshake_retransmit_ladder() {
        let mut h = harness(DetectionMode::CountBased);

        h.detector
            .on_packet_sent(1, true, true, 1200, Bytes::from_static(b"h1"), ms(0))
            .unwrap();
        // No RTT sample: 2 * default initial RTT
        assert_eq!(h.detector.alarm_deadline(), Some(ms(200)));

        h.detector.on_timer_tick(ms(200));

        assert_eq!(
            h.transmitter.0.borrow().retransmitted,
            vec![Bytes::from_static(b"h1")]
        );
        let stats = h.detector.stats();
        assert_eq!(stats.handshake_count, 1);
        assert_eq!(stats.unacked_packets, 0);
        assert_eq!(stats.handshake_outstanding, 0);
        // Nothing left in flight until the rebuilt packet is reported sent
        assert_eq!(stats.alarm_deadline, None);

        h.detector
            .on_packet_sent(2, true, true, 1200, Bytes::from_static(b"h1'"), ms(200))
            .unwrap();
        // Backoff doubles: 200ms * 2^1
        assert_eq!(h.detector.alarm_deadline(), Some(ms(600)));
        assert_invariants(&h);
    }

    #[test]
    fn test_handshake_retransmit_stops_at_first_non_handshake() {
        let mut h = harness(DetectionMode::CountBased);

        h.detector
            .on_packet_sent(1, true, true, 1200, Bytes::from_static(b"h1"), ms(0))
            .unwrap();
        h.detector
            .on_packet_sent(2, true, true, 1200, Bytes::from_static(b"h2"), ms(1))
            .unwrap();
        h.detector
            .on_packet_sent(3, true, false, 1200, Bytes::from_static(b"app"), ms(2))
            .unwrap();

        h.detector.on_timer_tick(ms(200));

        assert_eq!(
            h.transmitter.0.borrow().retransmitted,
            vec![Bytes::from_static(b"h1"), Bytes::from_static(b"h2")]
        );
        let remaining: Vec<_> = h.detector.sent_packets.keys().copied().collect();
        assert_eq!(remaining, vec![3]);
        assert_eq!(h.detector.stats().handshake_count, 1);
        assert_invariants(&h);
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    #[test]
    fn test_shutdown_clears_state_and_rejects_events() {
        let mut h = harness(DetectionMode::CountBased);

        send(&mut h, 1, ms(0));
        h.detector.shutdown();

        let stats = h.detector.stats();
        assert_eq!(stats.alarm_deadline, None);
        assert_eq!(stats.unacked_packets, 0);

        assert_eq!(
            h.detector
                .on_packet_sent(2, true, false, 1200, Bytes::new(), ms(1))
                .unwrap_err(),
            Error::ShutDown
        );
        assert_eq!(
            h.detector
                .on_ack_received(&AckFrame::single(1, 0), ms(1))
                .unwrap_err(),
            Error::ShutDown
        );
        // Ticks after shutdown do nothing
        h.detector.on_timer_tick(ms(500));
        assert!(h.transmitter.0.borrow().retransmitted.is_empty());
    }

    #[test]
    fn test_interests_is_ack_only() {
        assert_eq!(TestDetector::interests(), &[FRAME_TYPE_ACK]);
    }
}
