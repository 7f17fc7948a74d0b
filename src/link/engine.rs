//! Per-link protocol coordinator.
//!
//! One [`LinkEngine`] owns the transmit queue and receive buffer for a
//! single connected peer. The engine is event-driven and lock-free: every
//! method takes an explicit `now`, mutates state, and returns the outputs
//! the environment must act on. The environment supplies the byte
//! transport (a `send(bytes)` primitive plus an inbound byte stream) and a
//! receipt channel; the engine supplies everything between "application
//! payload" and "parcel bytes on the wire".
//!
//! Exclusion discipline: the engine itself is a plain owned object. Run it
//! on a single task, behind a mutex, or inside an actor - whichever makes
//! "read state, then prune or request" atomic with respect to concurrent
//! ingest. Suspension points (pacing waits, listen windows, receipt waits)
//! are exposed as deadlines via [`LinkEngine::next_deadline`], so the
//! owner yields between events instead of blocking inside the engine.

use std::time::SystemTime;

use bytes::Bytes;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::protocol::metrics::Metrics;
use crate::protocol::{Error, MessageId, Receipt, Result};

use super::housekeeping::{self, HousekeepingConfig, HousekeepingEvent};
use super::receive::ReceiveBuffer;
use super::transmit::{TransmitConfig, TransmitEvent, TransmitQueue};

/// Configuration for one link engine.
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Transmit-side pacing, retry, and retention tunables.
    pub transmit: TransmitConfig,
    /// Housekeeping cadence and timeouts.
    pub housekeeping: HousekeepingConfig,
    /// Seed for identifier selection; `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

/// Actions the environment must carry out on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutput {
    /// Write these parcel bytes to the link, then report the outcome via
    /// [`LinkEngine::on_write_result`]. At most one is outstanding at a
    /// time.
    SendParcel(Vec<u8>),
    /// Transmit this receipt to the peer.
    SendReceipt(Receipt),
    /// A message reassembled and verified; deliver it to the application.
    MessageReady(Bytes),
    /// The peer confirmed delivery of an outbound message.
    DeliveryConfirmed(MessageId),
    /// Retention expired without confirmation - the only user-visible
    /// failure this protocol reports.
    DeliveryUnconfirmed(MessageId),
}

/// Reliable-delivery state machine for a single connected peer.
#[derive(Debug)]
pub struct LinkEngine {
    transmit: TransmitQueue,
    receive: ReceiveBuffer,
    housekeeping: HousekeepingConfig,
    rng: StdRng,
    next_sweep_at: Option<SystemTime>,
}

impl LinkEngine {
    /// Create an engine for a freshly connected link.
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            transmit: TransmitQueue::new(config.transmit),
            receive: ReceiveBuffer::new(),
            housekeeping: config.housekeeping,
            rng,
            next_sweep_at: None,
        }
    }

    /// Queue an application payload for reliable delivery.
    ///
    /// Returns the identifier the caller can correlate with later
    /// [`LinkOutput::DeliveryConfirmed`] / [`LinkOutput::DeliveryUnconfirmed`]
    /// outputs. Call [`poll`](Self::poll) afterwards to start the send.
    pub fn enqueue_message(
        &mut self,
        payload: Bytes,
        peer_supports_compression: bool,
        now: SystemTime,
    ) -> Result<MessageId> {
        self.transmit
            .enqueue(&payload, peer_supports_compression, &mut self.rng, now)
    }

    /// Ingest raw parcel bytes from the link.
    ///
    /// Malformed buffers are dropped and logged; they never escalate.
    pub fn accept_frame(&mut self, bytes: &[u8], now: SystemTime) -> Vec<LinkOutput> {
        let id = match self.receive.accept(bytes, now) {
            Ok(id) => id,
            Err(err) => {
                Metrics::record_malformed_parcel();
                debug!(error = %err, len = bytes.len(), "dropping malformed parcel");
                return self.pump(now);
            }
        };

        let mut outputs = Vec::new();
        if self.receive.is_complete(id) {
            match self.receive.assemble(id) {
                Ok(payload) => {
                    debug!(id = %id, len = payload.len(), "message reassembled");
                    self.receive.clear(id);
                    outputs.push(LinkOutput::SendReceipt(Receipt::complete(id)));
                    outputs.push(LinkOutput::MessageReady(payload));
                }
                Err(Error::ChecksumMismatch { declared, computed }) => {
                    // One checksum_failed receipt per attempt, never a
                    // missing receipt for the same attempt. The record is
                    // dropped so the full retransmission re-enters through
                    // the header path.
                    debug!(id = %id, declared, computed, "reassembly failed verification");
                    self.receive.clear(id);
                    outputs.push(LinkOutput::SendReceipt(Receipt::checksum_failed(id)));
                }
                Err(err @ (Error::UnsupportedCompression { .. } | Error::Decompression(_))) => {
                    warn!(id = %id, error = %err, "discarding unrecoverable message");
                    self.receive.clear(id);
                }
                Err(err) => {
                    debug!(id = %id, error = %err, "assembly not possible yet");
                }
            }
        }

        outputs.extend(self.pump(now));
        outputs
    }

    /// Ingest a receipt the environment received from the peer.
    pub fn accept_receipt(&mut self, receipt: &Receipt, now: SystemTime) -> Vec<LinkOutput> {
        let mut outputs = map_transmit_events(self.transmit.on_receipt(receipt, now));
        outputs.extend(self.pump(now));
        outputs
    }

    /// Report the outcome of the last [`LinkOutput::SendParcel`] write.
    pub fn on_write_result(&mut self, success: bool, now: SystemTime) -> Vec<LinkOutput> {
        let mut outputs = map_transmit_events(self.transmit.on_write_result(success, now));
        outputs.extend(self.pump(now));
        outputs
    }

    /// The underlying link dropped: abort and requeue any in-progress
    /// send. Inbound partial state is deliberately left untouched - it may
    /// still complete after reconnection, until its own timeout fires.
    pub fn on_link_down(&mut self, now: SystemTime) {
        debug!("link down");
        self.transmit.on_link_down(now);
    }

    /// The link is available again; sending resumes on the next poll.
    pub fn on_link_up(&mut self) {
        debug!("link up");
        self.transmit.on_link_up();
    }

    /// Advance timers: transmit pacing, receipt waits, and the
    /// housekeeping sweep.
    pub fn poll(&mut self, now: SystemTime) -> Vec<LinkOutput> {
        self.pump(now)
    }

    /// Earliest instant at which [`poll`](Self::poll) will have work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<SystemTime> {
        match (self.transmit.next_deadline(), self.next_sweep_at) {
            (Some(transmit), Some(sweep)) => Some(transmit.min(sweep)),
            (Some(deadline), None) | (None, Some(deadline)) => Some(deadline),
            (None, None) => None,
        }
    }

    /// Whether any outbound or inbound state is still live.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.transmit.is_idle() && self.receive.pending_len() == 0
    }

    fn pump(&mut self, now: SystemTime) -> Vec<LinkOutput> {
        let mut outputs = Vec::new();

        match self.next_sweep_at {
            None => self.next_sweep_at = Some(now + self.housekeeping.tick),
            Some(due) if due <= now => {
                let events = housekeeping::run_sweep(
                    &self.housekeeping,
                    &mut self.transmit,
                    &mut self.receive,
                    now,
                );
                outputs.extend(events.into_iter().filter_map(|event| match event {
                    HousekeepingEvent::Expired { id, confirmed } => {
                        (!confirmed).then_some(LinkOutput::DeliveryUnconfirmed(id))
                    }
                    HousekeepingEvent::RequestMissing(receipt) => {
                        Some(LinkOutput::SendReceipt(receipt))
                    }
                    HousekeepingEvent::InboundDiscarded(_) => None,
                }));
                self.next_sweep_at = Some(now + self.housekeeping.tick);
            }
            Some(_) => {}
        }

        outputs.extend(map_transmit_events(self.transmit.poll(now)));
        outputs
    }
}

fn map_transmit_events(events: Vec<TransmitEvent>) -> Vec<LinkOutput> {
    events
        .into_iter()
        .filter_map(|event| match event {
            TransmitEvent::Parcel { bytes, .. } => Some(LinkOutput::SendParcel(bytes)),
            TransmitEvent::Delivered { id } => Some(LinkOutput::DeliveryConfirmed(id)),
            TransmitEvent::AttemptFailed { id } => {
                debug!(id = %id, "send attempt failed, message retained");
                None
            }
            TransmitEvent::Expired { id, confirmed } => {
                (!confirmed).then_some(LinkOutput::DeliveryUnconfirmed(id))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use crate::protocol::split_into_parcels;

    use super::*;

    fn engine() -> LinkEngine {
        LinkEngine::new(LinkConfig {
            rng_seed: Some(7),
            ..LinkConfig::default()
        })
    }

    fn base() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000)
    }

    fn receipts(outputs: &[LinkOutput]) -> Vec<&Receipt> {
        outputs
            .iter()
            .filter_map(|output| match output {
                LinkOutput::SendReceipt(receipt) => Some(receipt),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn clean_single_parcel_transfer() {
        let mut sender = engine();
        let mut receiver = engine();
        let now = base();

        // Peer does not support compression; "hello world" fits one parcel
        // with flags 0x00.
        sender
            .enqueue_message(Bytes::from_static(b"hello world"), false, now)
            .unwrap();
        let outputs = sender.poll(now);
        let [LinkOutput::SendParcel(parcel)] = &outputs[..] else {
            panic!("expected one parcel, got {outputs:?}");
        };
        assert_eq!(parcel[8], 0x00);

        let outputs = receiver.accept_frame(parcel, now);
        assert!(outputs.contains(&LinkOutput::MessageReady(Bytes::from_static(b"hello world"))));
        let got = receipts(&outputs);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].status, crate::protocol::ReceiptStatus::Complete);
    }

    #[test]
    fn checksum_failure_emits_exactly_one_receipt_and_no_missing() {
        let mut receiver = engine();
        let id = MessageId::parse("AK").unwrap();
        let payload = vec![0x11u8; 400];
        let mut parcels = split_into_parcels(id, 0, &payload).unwrap();
        assert_eq!(parcels.len(), 2);
        let tail = parcels[1].len() - 1;
        parcels[1][tail] ^= 0xFF;

        let now = base();
        assert!(receipts(&receiver.accept_frame(&parcels[0], now)).is_empty());
        let outputs = receiver.accept_frame(&parcels[1], now);
        let got = receipts(&outputs);
        assert_eq!(got.len(), 1);
        assert_eq!(*got[0], Receipt::checksum_failed(id));

        // The record is gone; a later sweep must not also request parcels.
        let sweep_time = now + Duration::from_secs(10);
        assert!(receipts(&receiver.poll(sweep_time)).is_empty());
    }

    #[test]
    fn malformed_frames_are_dropped_quietly() {
        let mut receiver = engine();
        assert!(receipts(&receiver.accept_frame(b"AK", base())).is_empty());
        assert!(receipts(&receiver.accept_frame(b"", base())).is_empty());
        assert!(receiver.is_idle());
    }

    #[test]
    fn housekeeping_requests_missing_parcels_on_cadence() {
        let mut receiver = engine();
        let id = MessageId::parse("QD").unwrap();
        let payload = vec![0x22u8; 271 + 2 * 276];
        let parcels = split_into_parcels(id, 0, &payload).unwrap();
        assert_eq!(parcels.len(), 3);

        let now = base();
        receiver.accept_frame(&parcels[0], now);
        receiver.accept_frame(&parcels[2], now);

        // First poll arms the sweep; the receipt comes no earlier than the
        // 5-second quiet gap, on the next 10-second tick.
        receiver.poll(now);
        assert!(receipts(&receiver.poll(now + Duration::from_secs(4))).is_empty());
        let outputs = receiver.poll(now + Duration::from_secs(10));
        let got = receipts(&outputs);
        assert_eq!(got.len(), 1);
        assert_eq!(*got[0], Receipt::missing(id, vec![2]));
    }

    #[test]
    fn unsupported_compression_discards_without_receipt() {
        let mut receiver = engine();
        let id = MessageId::parse("XX").unwrap();
        let parcels = split_into_parcels(id, 0x0F, b"opaque").unwrap();
        let outputs = receiver.accept_frame(&parcels[0], base());
        assert!(receipts(&outputs).is_empty());
        assert!(receiver.is_idle());
    }

    #[test]
    fn delivery_unconfirmed_surfaces_after_retention() {
        let mut sender = engine();
        let mut now = base();
        let id = sender
            .enqueue_message(Bytes::from_static(b"payload"), false, now)
            .unwrap();

        let outputs = sender.poll(now);
        assert_eq!(outputs.len(), 1);
        sender.on_write_result(true, now);

        // Receipt never arrives; the attempt fails and the message sits in
        // retention until the sweep discards it.
        now += TransmitConfig::default().receipt_wait;
        assert!(sender.poll(now).is_empty());

        now += TransmitConfig::default().retention_window;
        let outputs = sender.poll(now);
        assert_eq!(outputs, vec![LinkOutput::DeliveryUnconfirmed(id)]);
        assert!(sender.is_idle());
    }

    #[test]
    fn next_deadline_tracks_sweep_and_pacing() {
        let mut engine = engine();
        let now = base();
        assert!(engine.next_deadline().is_none());

        // First poll arms the housekeeping tick.
        engine.poll(now);
        assert_eq!(
            engine.next_deadline(),
            Some(now + HousekeepingConfig::default().tick)
        );
    }
}
