//! # Detector Actor
//!
//! Single-owner event loop around a [`LossDetector`]. Packet-sent
//! notifications, inbound frames, and the periodic alarm tick all arrive as
//! messages on one queue, so the detector needs no lock and the transmitter
//! is only ever called from this task. The tick subscription exists exactly
//! while an alarm is armed and polls the deadline at a fixed granularity.

#![forbid(unsafe_code)]

use crate::config::ALARM_GRANULARITY;
use crate::error::{Error, Result};
use crate::frames::Frame;
use crate::recovery::{CongestionController, DetectorStats, LossDetector, PacketTransmitter};
use crate::types::{Instant, PacketNumber};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

enum Command {
    PacketSent {
        packet_number: PacketNumber,
        retransmittable: bool,
        handshake: bool,
        size: usize,
        payload: Bytes,
    },
    Frame(Frame),
    Stats(oneshot::Sender<DetectorStats>),
    Shutdown,
}

/// Cloneable handle to a spawned detector task.
///
/// Dropping every handle shuts the detector down.
#[derive(Clone)]
pub struct LossDetectorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LossDetectorHandle {
    /// Notify the detector of a packet handed to the transmitter.
    pub fn on_packet_sent(
        &self,
        packet_number: PacketNumber,
        retransmittable: bool,
        handshake: bool,
        size: usize,
        payload: Bytes,
    ) -> Result<()> {
        self.send(Command::PacketSent {
            packet_number,
            retransmittable,
            handshake,
            size,
            payload,
        })
    }

    /// Deliver a frame routed to loss detection.
    pub fn handle_frame(&self, frame: Frame) -> Result<()> {
        self.send(Command::Frame(frame))
    }

    /// Snapshot of the detector's state.
    pub async fn stats(&self) -> Result<DetectorStats> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        response.await.map_err(|_| Error::ShutDown)
    }

    /// Largest packet number ever acknowledged by the peer.
    pub async fn largest_acked_packet_number(&self) -> Result<PacketNumber> {
        Ok(self.stats().await?.largest_acked_packet)
    }

    /// Stop the detector. Events sent afterwards are dropped.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ShutDown)
    }
}

/// Spawn a detector onto the current tokio runtime.
///
/// Returns the event handle and the task's join handle.
pub fn spawn<T, C>(detector: LossDetector<T, C>) -> (LossDetectorHandle, JoinHandle<()>)
where
    T: PacketTransmitter + Send + 'static,
    C: CongestionController + Send + 'static,
{
    let (commands, inbox) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(detector, inbox));
    (LossDetectorHandle { commands }, task)
}

async fn run<T, C>(mut detector: LossDetector<T, C>, mut inbox: mpsc::UnboundedReceiver<Command>)
where
    T: PacketTransmitter + Send + 'static,
    C: CongestionController + Send + 'static,
{
    let epoch = tokio::time::Instant::now();
    let mut tick: Option<tokio::time::Interval> = None;

    loop {
        // The tick subscription mirrors the armed alarm: created lazily when
        // a deadline appears, dropped as soon as nothing is outstanding.
        match (detector.alarm_deadline().is_some(), tick.is_some()) {
            (true, false) => {
                let mut interval = tokio::time::interval(ALARM_GRANULARITY);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                tick = Some(interval);
            }
            (false, true) => {
                tick = None;
            }
            _ => {}
        }

        let command = if let Some(interval) = tick.as_mut() {
            tokio::select! {
                command = inbox.recv() => command,
                _ = interval.tick() => {
                    detector.on_timer_tick(monotonic_now(epoch));
                    continue;
                }
            }
        } else {
            inbox.recv().await
        };

        match command {
            Some(Command::PacketSent {
                packet_number,
                retransmittable,
                handshake,
                size,
                payload,
            }) => {
                // Faults are logged by the detector; the notification has no
                // reply path.
                let _ = detector.on_packet_sent(
                    packet_number,
                    retransmittable,
                    handshake,
                    size,
                    payload,
                    monotonic_now(epoch),
                );
            }
            Some(Command::Frame(frame)) => {
                let _ = detector.handle_frame(&frame, monotonic_now(epoch));
            }
            Some(Command::Stats(reply)) => {
                let _ = reply.send(detector.stats());
            }
            Some(Command::Shutdown) | None => {
                debug!("detector actor stopping");
                detector.shutdown();
                break;
            }
        }
    }
}

fn monotonic_now(epoch: tokio::time::Instant) -> Instant {
    Instant::from_nanos(epoch.elapsed().as_nanos() as u64)
}

// ============================================================================
// Unit Tests
// ============================================================================
