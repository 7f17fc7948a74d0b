//! Outbound send, retry, and retention state machine.
//!
//! The transport is effectively half-duplex with a single physical link
//! per peer, so sends are serialized: one message is fully in flight at a
//! time and the rest wait in a FIFO queue. Pacing (inter-parcel delays and
//! the periodic listen window) is pure timing policy, surfaced as
//! deadlines the caller observes via [`TransmitQueue::poll`] and
//! [`TransmitQueue::next_deadline`]; nothing here touches the wire format.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, instrument, trace};

use crate::protocol::compress::{self, CompressionConfig};
use crate::protocol::metrics::Metrics;
use crate::protocol::{MessageId, Receipt, ReceiptStatus, Result, split_into_parcels};

/// Configurable parameters driving the transmit queue.
#[derive(Debug, Clone)]
pub struct TransmitConfig {
    /// Pause between consecutive parcels.
    pub inter_parcel_delay: Duration,
    /// Length of the listen window opened after every burst.
    pub listen_window: Duration,
    /// Parcels sent between listen windows.
    pub parcels_per_listen: u32,
    /// How long to wait for a receipt after the full sequence is sent.
    pub receipt_wait: Duration,
    /// Retention window after the last parcel send.
    pub retention_window: Duration,
    /// Write retries per parcel before the attempt is abandoned.
    pub write_retries: u32,
    /// Base backoff applied to a failed write, doubled per retry.
    pub write_backoff: Duration,
    /// Sender-side compression decision tunables.
    pub compression: CompressionConfig,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            inter_parcel_delay: Duration::from_millis(100),
            listen_window: Duration::from_millis(200),
            parcels_per_listen: 5,
            receipt_wait: Duration::from_secs(10),
            retention_window: Duration::from_secs(120),
            write_retries: 3,
            write_backoff: Duration::from_millis(250),
            compression: CompressionConfig::default(),
        }
    }
}

/// Events produced by the transmit queue for its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitEvent {
    /// A parcel is ready for the link. The driver must write it and report
    /// the outcome via [`TransmitQueue::on_write_result`] before another
    /// parcel is produced.
    Parcel {
        /// Message the parcel belongs to.
        id: MessageId,
        /// Encoded parcel bytes.
        bytes: Vec<u8>,
        /// Whether this parcel was sent before.
        retransmission: bool,
    },
    /// A `complete` receipt confirmed delivery; the message is deleted.
    Delivered {
        /// Confirmed message.
        id: MessageId,
    },
    /// The send attempt failed locally (receipt timeout or exhausted write
    /// retries). The message still enters retention, since a delayed
    /// receipt may yet arrive.
    AttemptFailed {
        /// Affected message.
        id: MessageId,
    },
    /// The message left retention.
    Expired {
        /// Discarded message.
        id: MessageId,
        /// Whether a `complete` receipt was ever observed.
        confirmed: bool,
    },
}

#[derive(Debug)]
struct OutboundMessage {
    id: MessageId,
    /// Encoded once; retransmission preserves the original chunk
    /// boundaries, re-slicing is never performed.
    parcels: Vec<Vec<u8>>,
    created_at: SystemTime,
    retry_count: u32,
    /// Parcel numbers (1-indexed, ascending) the next attempt must send.
    attempt: Vec<u16>,
    retransmission: bool,
}

impl OutboundMessage {
    fn fresh(id: MessageId, parcels: Vec<Vec<u8>>, now: SystemTime) -> Self {
        let attempt = (1..=u16::try_from(parcels.len()).expect("split bounds total")).collect();
        Self {
            id,
            parcels,
            created_at: now,
            retry_count: 0,
            attempt,
            retransmission: false,
        }
    }
}

#[derive(Debug)]
enum SendPhase {
    /// Next parcel may be emitted once the deadline passes.
    Paced { next_send_at: SystemTime },
    /// A parcel was handed to the driver; waiting for the write outcome.
    AwaitingWrite,
    /// Full attempt sent; waiting for a receipt until the deadline.
    AwaitingReceipt { deadline: SystemTime },
}

#[derive(Debug)]
struct ActiveSend {
    msg: OutboundMessage,
    remaining: VecDeque<u16>,
    phase: SendPhase,
    burst: u32,
    write_attempts: u32,
    last_sent_at: Option<SystemTime>,
}

impl ActiveSend {
    fn start(msg: OutboundMessage, now: SystemTime) -> Self {
        let remaining = msg.attempt.iter().copied().collect();
        Self {
            msg,
            remaining,
            phase: SendPhase::Paced { next_send_at: now },
            burst: 0,
            write_attempts: 0,
            last_sent_at: None,
        }
    }
}

#[derive(Debug)]
struct RetainedMessage {
    parcels: Vec<Vec<u8>>,
    created_at: SystemTime,
    retry_count: u32,
    retain_until: SystemTime,
    confirmed: bool,
}

/// Serializes outbound messages, manages pacing, retry, and retention.
#[derive(Debug)]
pub struct TransmitQueue {
    config: TransmitConfig,
    pending: VecDeque<OutboundMessage>,
    active: Option<ActiveSend>,
    retained: HashMap<MessageId, RetainedMessage>,
    link_up: bool,
}

impl TransmitQueue {
    /// Create an empty queue; the link starts up.
    #[must_use]
    pub fn new(config: TransmitConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            active: None,
            retained: HashMap::new(),
            link_up: true,
        }
    }

    /// Split a payload into parcels and queue it for transmission.
    ///
    /// The compression decision is made exactly once, here, before the
    /// first transmission; the parcel sequence is immutable afterwards.
    /// The chosen identifier is guaranteed distinct from every in-flight
    /// or retained message.
    #[instrument(level = "debug", skip(self, payload, rng))]
    pub fn enqueue<R: Rng + ?Sized>(
        &mut self,
        payload: &Bytes,
        peer_supports_compression: bool,
        rng: &mut R,
        now: SystemTime,
    ) -> Result<MessageId> {
        let id = self.pick_id(rng)?;
        let (wire, flags) = compress::negotiate(payload, peer_supports_compression, &self.config.compression);
        let parcels = split_into_parcels(id, flags, &wire)?;
        debug!(id = %id, parcels = parcels.len(), flags, "message enqueued");
        Metrics::record_message_enqueued();
        self.pending
            .push_back(OutboundMessage::fresh(id, parcels, now));
        Ok(id)
    }

    /// Advance the state machine: activate the next queued message, emit a
    /// parcel whose pacing deadline passed, or time out a receipt wait.
    ///
    /// At most one [`TransmitEvent::Parcel`] is produced per call; the
    /// driver must report its write outcome before polling again.
    pub fn poll(&mut self, now: SystemTime) -> Vec<TransmitEvent> {
        let mut events = Vec::new();
        if !self.link_up {
            return events;
        }

        if self.active.is_none() {
            if let Some(msg) = self.pending.pop_front() {
                trace!(id = %msg.id, "activating message");
                self.active = Some(ActiveSend::start(msg, now));
            }
        }

        let Some(active) = self.active.as_mut() else {
            return events;
        };

        match active.phase {
            SendPhase::Paced { next_send_at } if next_send_at <= now => {
                let number = *active
                    .remaining
                    .front()
                    .expect("paced phase implies parcels remain");
                let bytes = active.msg.parcels[usize::from(number) - 1].clone();
                trace!(id = %active.msg.id, number, "emitting parcel");
                Metrics::record_parcel_sent(active.msg.retransmission);
                active.phase = SendPhase::AwaitingWrite;
                events.push(TransmitEvent::Parcel {
                    id: active.msg.id,
                    bytes,
                    retransmission: active.msg.retransmission,
                });
            }
            SendPhase::AwaitingReceipt { deadline } if deadline <= now => {
                let active = self.active.take().expect("checked above");
                let id = active.msg.id;
                debug!(id = %id, "receipt wait expired, attempt failed");
                events.push(TransmitEvent::AttemptFailed { id });
                self.retain(active, now);
            }
            _ => {}
        }

        events
    }

    /// Report the outcome of the last emitted parcel write.
    ///
    /// A failed write is retried with exponential backoff; exhausting the
    /// retry budget abandons the attempt and the message moves straight to
    /// retention as a failed send.
    pub fn on_write_result(&mut self, success: bool, now: SystemTime) -> Vec<TransmitEvent> {
        let mut events = Vec::new();
        let Some(active) = self.active.as_mut() else {
            return events;
        };
        if !matches!(active.phase, SendPhase::AwaitingWrite) {
            return events;
        }

        if success {
            active.remaining.pop_front();
            active.write_attempts = 0;
            active.burst += 1;
            active.last_sent_at = Some(now);

            if active.remaining.is_empty() {
                debug!(id = %active.msg.id, "full sequence sent, awaiting receipt");
                active.phase = SendPhase::AwaitingReceipt {
                    deadline: now + self.config.receipt_wait,
                };
            } else {
                let pause = if active.burst % self.config.parcels_per_listen == 0 {
                    trace!(id = %active.msg.id, "opening listen window");
                    self.config.listen_window
                } else {
                    self.config.inter_parcel_delay
                };
                active.phase = SendPhase::Paced {
                    next_send_at: now + pause,
                };
            }
            return events;
        }

        active.write_attempts += 1;
        if active.write_attempts > self.config.write_retries {
            let active = self.active.take().expect("checked above");
            let id = active.msg.id;
            debug!(id = %id, "write retries exhausted, attempt abandoned");
            events.push(TransmitEvent::AttemptFailed { id });
            self.retain(active, now);
            return events;
        }

        let backoff = self.config.write_backoff * 2u32.pow(active.write_attempts - 1);
        trace!(
            id = %active.msg.id,
            attempt = active.write_attempts,
            ?backoff,
            "parcel write failed, backing off"
        );
        active.phase = SendPhase::Paced {
            next_send_at: now + backoff,
        };
        events
    }

    /// Apply a receipt from the peer.
    #[instrument(level = "debug", skip(self, receipt), fields(id = %receipt.msg_id))]
    pub fn on_receipt(&mut self, receipt: &Receipt, now: SystemTime) -> Vec<TransmitEvent> {
        match &receipt.status {
            ReceiptStatus::Complete => self.on_complete(receipt.msg_id),
            ReceiptStatus::Missing { parcels } => self.on_missing(receipt.msg_id, parcels, now),
            ReceiptStatus::ChecksumFailed => self.on_checksum_failed(receipt.msg_id, now),
        }
    }

    /// Abort any in-progress send and requeue it at the head of the queue
    /// without incrementing its retry count; this is a transport-level
    /// failure, not a protocol-level one. Messages awaiting a receipt move
    /// to retention, where a post-reconnect receipt can still find them.
    pub fn on_link_down(&mut self, now: SystemTime) {
        self.link_up = false;
        if let Some(active) = self.active.take() {
            match active.phase {
                SendPhase::AwaitingReceipt { .. } => {
                    debug!(id = %active.msg.id, "link lost while awaiting receipt, retaining");
                    self.retain(active, now);
                }
                _ => {
                    debug!(id = %active.msg.id, "link lost mid-send, requeueing at head");
                    self.pending.push_front(active.msg);
                }
            }
        }
    }

    /// Resume sending once the link is available again.
    pub fn on_link_up(&mut self) {
        self.link_up = true;
    }

    /// Discard retained messages whose retention window elapsed.
    pub fn prune_retained(&mut self, now: SystemTime) -> Vec<TransmitEvent> {
        let mut expired: Vec<MessageId> = self
            .retained
            .iter()
            .filter(|(_, retained)| retained.retain_until <= now)
            .map(|(&id, _)| id)
            .collect();
        expired.sort_unstable();

        let mut events = Vec::new();
        for id in expired {
            let retained = self.retained.remove(&id).expect("collected above");
            debug!(id = %id, confirmed = retained.confirmed, "retention expired");
            Metrics::record_retention_expiry();
            if !retained.confirmed {
                Metrics::record_message_unconfirmed();
            }
            events.push(TransmitEvent::Expired {
                id,
                confirmed: retained.confirmed,
            });
        }
        events
    }

    /// Earliest instant at which [`poll`](Self::poll) will have work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<SystemTime> {
        if !self.link_up {
            return None;
        }
        match self.active.as_ref() {
            Some(active) => match active.phase {
                SendPhase::Paced { next_send_at } => Some(next_send_at),
                SendPhase::AwaitingReceipt { deadline } => Some(deadline),
                SendPhase::AwaitingWrite => None,
            },
            // An idle queue with pending work can activate immediately.
            None if !self.pending.is_empty() => Some(SystemTime::UNIX_EPOCH),
            None => None,
        }
    }

    /// Whether nothing is queued, active, or retained.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_none() && self.retained.is_empty()
    }

    /// Number of messages currently held in retention.
    #[must_use]
    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    fn on_complete(&mut self, id: MessageId) -> Vec<TransmitEvent> {
        if let Some(active) = self.active.as_ref() {
            if active.msg.id == id {
                debug!(id = %id, "complete receipt for active message");
                self.active = None;
                Metrics::record_message_delivered();
                return vec![TransmitEvent::Delivered { id }];
            }
        }
        if self.retained.remove(&id).is_some() {
            debug!(id = %id, "complete receipt for retained message");
            Metrics::record_message_delivered();
            return vec![TransmitEvent::Delivered { id }];
        }
        if let Some(position) = self.pending.iter().position(|msg| msg.id == id) {
            // A requeued message the peer already has in full.
            debug!(id = %id, "complete receipt for requeued message");
            self.pending.remove(position);
            Metrics::record_message_delivered();
            return vec![TransmitEvent::Delivered { id }];
        }
        debug!(id = %id, "complete receipt for unknown message, ignoring");
        Vec::new()
    }

    fn on_missing(&mut self, id: MessageId, parcels: &[u16], now: SystemTime) -> Vec<TransmitEvent> {
        if let Some(active) = self.active.as_mut() {
            if active.msg.id == id {
                if matches!(active.phase, SendPhase::AwaitingReceipt { .. }) {
                    let plan = Self::validated_plan(parcels, active.msg.parcels.len());
                    if plan.is_empty() {
                        debug!(id = %id, "missing receipt without valid numbers, ignoring");
                        return Vec::new();
                    }
                    debug!(id = %id, count = plan.len(), "retransmitting missing parcels");
                    active.msg.attempt = plan;
                    active.msg.retransmission = true;
                    active.msg.retry_count += 1;
                    active.remaining = active.msg.attempt.iter().copied().collect();
                    active.burst = 0;
                    active.write_attempts = 0;
                    active.phase = SendPhase::Paced { next_send_at: now };
                } else {
                    // The in-progress attempt supersedes the request; the
                    // peer will re-request after its cadence if needed.
                    trace!(id = %id, "missing receipt during active send, ignoring");
                }
                return Vec::new();
            }
        }

        if let Some(retained) = self.retained.remove(&id) {
            let plan = Self::validated_plan(parcels, retained.parcels.len());
            if plan.is_empty() {
                debug!(id = %id, "missing receipt without valid numbers, re-retaining");
                self.retained.insert(id, retained);
                return Vec::new();
            }
            debug!(id = %id, count = plan.len(), "reactivating retained message for retransmit");
            let msg = OutboundMessage {
                id,
                parcels: retained.parcels,
                created_at: retained.created_at,
                retry_count: retained.retry_count + 1,
                attempt: plan,
                retransmission: true,
            };
            self.pending.push_front(msg);
            return Vec::new();
        }

        // Retention expired, the identifier was never ours, or the message
        // is already queued for a fresh attempt: a normal, expected
        // condition on this link, not an error.
        debug!(id = %id, "unfulfillable missing receipt, dropping");
        Vec::new()
    }

    fn on_checksum_failed(&mut self, id: MessageId, now: SystemTime) -> Vec<TransmitEvent> {
        let full_plan = |count: usize| -> Vec<u16> {
            (1..=u16::try_from(count).expect("split bounds total")).collect()
        };

        if let Some(active) = self.active.as_mut() {
            if active.msg.id == id {
                if matches!(active.phase, SendPhase::AwaitingReceipt { .. }) {
                    debug!(id = %id, "checksum failed, retransmitting entire sequence");
                    active.msg.attempt = full_plan(active.msg.parcels.len());
                    active.msg.retransmission = true;
                    active.msg.retry_count += 1;
                    active.remaining = active.msg.attempt.iter().copied().collect();
                    active.burst = 0;
                    active.write_attempts = 0;
                    active.phase = SendPhase::Paced { next_send_at: now };
                } else {
                    trace!(id = %id, "checksum receipt during active send, ignoring");
                }
                return Vec::new();
            }
        }

        if let Some(retained) = self.retained.remove(&id) {
            debug!(id = %id, "checksum failed for retained message, resending in full");
            let attempt = full_plan(retained.parcels.len());
            let msg = OutboundMessage {
                id,
                parcels: retained.parcels,
                created_at: retained.created_at,
                retry_count: retained.retry_count + 1,
                attempt,
                retransmission: true,
            };
            self.pending.push_front(msg);
            return Vec::new();
        }

        debug!(id = %id, "checksum receipt after retention expiry, dropping");
        Vec::new()
    }

    fn retain(&mut self, active: ActiveSend, now: SystemTime) {
        let last_sent = active.last_sent_at.unwrap_or(now);
        let id = active.msg.id;
        let retained = RetainedMessage {
            parcels: active.msg.parcels,
            created_at: active.msg.created_at,
            retry_count: active.msg.retry_count,
            retain_until: last_sent + self.config.retention_window,
            confirmed: false,
        };
        self.retained.insert(id, retained);
    }

    fn validated_plan(parcels: &[u16], total: usize) -> Vec<u16> {
        let total = u16::try_from(total).expect("split bounds total");
        let mut plan: Vec<u16> = parcels
            .iter()
            .copied()
            .filter(|&number| number >= 1 && number <= total)
            .collect();
        plan.sort_unstable();
        plan.dedup();
        plan
    }

    fn pick_id<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<MessageId> {
        let in_use = |id: MessageId| {
            self.retained.contains_key(&id)
                || self.pending.iter().any(|msg| msg.id == id)
                || self.active.as_ref().is_some_and(|active| active.msg.id == id)
        };

        for _ in 0..64 {
            let id = MessageId::random(rng);
            if !in_use(id) {
                return Ok(id);
            }
        }
        // Crowded identifier space: fall back to a linear scan.
        for a in b'A'..=b'Z' {
            for b in b'A'..=b'Z' {
                let id = MessageId::from_bytes([a, b]).expect("alphabet by construction");
                if !in_use(id) {
                    return Ok(id);
                }
            }
        }
        Err(crate::protocol::Error::IdentifierSpaceExhausted)
    }
}
