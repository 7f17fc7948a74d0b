//! Periodic recovery sweep over transmit and receive state.
//!
//! The per-send receipt-wait timer fires once per attempt; if the receipt
//! itself is lost, nothing on the sender side would ever notice. The sweep
//! exists for exactly that case: it prunes expired retention, nudges stale
//! inbound transfers with `missing` receipts, and discards inbound
//! messages that will never finish. The three checks are independent of
//! each other, idempotent, and safe to run on empty state.

use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::protocol::metrics::Metrics;
use crate::protocol::{MessageId, Receipt};

use super::receive::ReceiveBuffer;
use super::transmit::{TransmitEvent, TransmitQueue};

/// Configurable parameters for the sweep.
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// Interval between sweeps.
    pub tick: Duration,
    /// Quiet period before an incomplete inbound message triggers a
    /// `missing` receipt.
    pub missing_request_gap: Duration,
    /// Hard ceiling on an inbound message's total age.
    pub inbound_timeout: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            missing_request_gap: Duration::from_secs(5),
            inbound_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HousekeepingEvent {
    /// A retained outbound message left retention.
    Expired {
        /// Discarded message.
        id: MessageId,
        /// Whether delivery was ever confirmed.
        confirmed: bool,
    },
    /// A `missing` receipt should be transmitted to the peer.
    RequestMissing(Receipt),
    /// An incomplete inbound message was discarded on timeout.
    InboundDiscarded(MessageId),
}

/// Run the three housekeeping checks once.
pub fn run_sweep(
    config: &HousekeepingConfig,
    transmit: &mut TransmitQueue,
    receive: &mut ReceiveBuffer,
    now: SystemTime,
) -> Vec<HousekeepingEvent> {
    let mut events = Vec::new();

    for event in transmit.prune_retained(now) {
        if let TransmitEvent::Expired { id, confirmed } = event {
            events.push(HousekeepingEvent::Expired { id, confirmed });
        }
    }

    for (id, parcels) in receive.due_missing_requests(config.missing_request_gap, now) {
        debug!(id = %id, missing = parcels.len(), "requesting missing parcels");
        Metrics::record_missing_request();
        events.push(HousekeepingEvent::RequestMissing(Receipt::missing(id, parcels)));
    }

    for id in receive.expire(config.inbound_timeout, now) {
        events.push(HousekeepingEvent::InboundDiscarded(id));
    }

    events
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use bytes::Bytes;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::protocol::{ReceiptStatus, split_into_parcels};

    use super::super::transmit::TransmitConfig;
    use super::*;

    fn base() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000)
    }

    #[test]
    fn sweep_on_empty_state_is_a_no_op() {
        let config = HousekeepingConfig::default();
        let mut transmit = TransmitQueue::new(TransmitConfig::default());
        let mut receive = ReceiveBuffer::new();
        assert!(run_sweep(&config, &mut transmit, &mut receive, base()).is_empty());
        assert!(run_sweep(&config, &mut transmit, &mut receive, base()).is_empty());
    }

    #[test]
    fn stale_inbound_message_triggers_one_missing_request() {
        let config = HousekeepingConfig::default();
        let mut transmit = TransmitQueue::new(TransmitConfig::default());
        let mut receive = ReceiveBuffer::new();
        let id = crate::protocol::MessageId::parse("AK").unwrap();

        let payload = vec![0x42u8; 271 + 276];
        let parcels = split_into_parcels(id, 0, &payload).unwrap();
        let now = base();
        receive.accept(&parcels[0], now).unwrap();

        // Quiet for the full gap: exactly one request, then silence until
        // another gap passes.
        let later = now + config.missing_request_gap;
        let events = run_sweep(&config, &mut transmit, &mut receive, later);
        assert_eq!(
            events,
            vec![HousekeepingEvent::RequestMissing(Receipt {
                msg_id: id,
                status: ReceiptStatus::Missing { parcels: vec![2] },
            })]
        );
        let soon = later + Duration::from_secs(1);
        assert!(run_sweep(&config, &mut transmit, &mut receive, soon).is_empty());
    }

    #[test]
    fn inbound_timeout_discards_partial_progress() {
        let config = HousekeepingConfig::default();
        let mut transmit = TransmitQueue::new(TransmitConfig::default());
        let mut receive = ReceiveBuffer::new();
        let id = crate::protocol::MessageId::parse("ZZ").unwrap();

        // 2 of 10 declared parcels, then nothing.
        let payload = vec![0x42u8; 271 + 9 * 276];
        let parcels = split_into_parcels(id, 0, &payload).unwrap();
        let now = base();
        receive.accept(&parcels[0], now).unwrap();
        receive.accept(&parcels[1], now).unwrap();

        let expiry = now + config.inbound_timeout;
        let events = run_sweep(&config, &mut transmit, &mut receive, expiry);
        assert!(events.contains(&HousekeepingEvent::InboundDiscarded(id)));
        assert!(!receive.is_complete(id));
        assert_eq!(receive.pending_len(), 0);
    }

    #[test]
    fn retention_expiry_reports_unconfirmed_delivery() {
        let config = HousekeepingConfig::default();
        let transmit_config = TransmitConfig::default();
        let mut transmit = TransmitQueue::new(transmit_config.clone());
        let mut receive = ReceiveBuffer::new();
        let mut rng = StdRng::seed_from_u64(9);

        let mut now = base();
        let id = transmit
            .enqueue(&Bytes::from_static(b"hi"), false, &mut rng, now)
            .unwrap();
        transmit.poll(now);
        transmit.on_write_result(true, now);
        now += transmit_config.receipt_wait;
        transmit.poll(now);

        now += transmit_config.retention_window;
        let events = run_sweep(&config, &mut transmit, &mut receive, now);
        assert_eq!(
            events,
            vec![HousekeepingEvent::Expired {
                id,
                confirmed: false,
            }]
        );
    }
}
