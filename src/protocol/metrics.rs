//! Track PLP protocol metrics without external dependencies.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal recording facade used by the link state machines.
pub(crate) struct Metrics;

static MESSAGES_ENQUEUED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DELIVERED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_UNCONFIRMED: AtomicU64 = AtomicU64::new(0);
static PARCELS_SENT: AtomicU64 = AtomicU64::new(0);
static PARCELS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static PARCELS_RETRANSMITTED: AtomicU64 = AtomicU64::new(0);
static MALFORMED_PARCELS: AtomicU64 = AtomicU64::new(0);
static CHECKSUM_FAILURES: AtomicU64 = AtomicU64::new(0);
static MISSING_REQUESTS: AtomicU64 = AtomicU64::new(0);
static RETENTION_EXPIRIES: AtomicU64 = AtomicU64::new(0);
static INBOUND_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

impl Metrics {
    #[inline]
    pub(crate) fn record_message_enqueued() {
        MESSAGES_ENQUEUED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_message_delivered() {
        MESSAGES_DELIVERED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_message_unconfirmed() {
        MESSAGES_UNCONFIRMED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_parcel_sent(retransmission: bool) {
        PARCELS_SENT.fetch_add(1, Ordering::Relaxed);
        if retransmission {
            PARCELS_RETRANSMITTED.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_parcel_received() {
        PARCELS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_malformed_parcel() {
        MALFORMED_PARCELS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_checksum_failure() {
        CHECKSUM_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_missing_request() {
        MISSING_REQUESTS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_retention_expiry() {
        RETENTION_EXPIRIES.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_inbound_timeout() {
        INBOUND_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn totals() -> MetricsSnapshot {
        MetricsSnapshot {
            messages_enqueued: MESSAGES_ENQUEUED.load(Ordering::Relaxed),
            messages_delivered: MESSAGES_DELIVERED.load(Ordering::Relaxed),
            messages_unconfirmed: MESSAGES_UNCONFIRMED.load(Ordering::Relaxed),
            parcels_sent: PARCELS_SENT.load(Ordering::Relaxed),
            parcels_received: PARCELS_RECEIVED.load(Ordering::Relaxed),
            parcels_retransmitted: PARCELS_RETRANSMITTED.load(Ordering::Relaxed),
            malformed_parcels: MALFORMED_PARCELS.load(Ordering::Relaxed),
            checksum_failures: CHECKSUM_FAILURES.load(Ordering::Relaxed),
            missing_requests: MISSING_REQUESTS.load(Ordering::Relaxed),
            retention_expiries: RETENTION_EXPIRIES.load(Ordering::Relaxed),
            inbound_timeouts: INBOUND_TIMEOUTS.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide snapshot of protocol counters.
#[must_use]
pub fn snapshot() -> MetricsSnapshot {
    Metrics::totals()
}

/// Lightweight snapshot of critical counters.
#[derive(Default, Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    /// Messages accepted by `enqueue_message`.
    pub messages_enqueued: u64,
    /// Messages confirmed by a `complete` receipt.
    pub messages_delivered: u64,
    /// Messages that left retention without confirmation.
    pub messages_unconfirmed: u64,
    /// Parcels handed to the link for writing.
    pub parcels_sent: u64,
    /// Parcels accepted by the receive buffer.
    pub parcels_received: u64,
    /// Sent parcels that were retransmissions.
    pub parcels_retransmitted: u64,
    /// Inbound buffers dropped before decoding.
    pub malformed_parcels: u64,
    /// Reassemblies that failed integrity verification.
    pub checksum_failures: u64,
    /// `missing` receipts emitted by housekeeping.
    pub missing_requests: u64,
    /// Retained outbound messages discarded on expiry.
    pub retention_expiries: u64,
    /// Inbound messages discarded by the 60-second timeout.
    pub inbound_timeouts: u64,
}

impl MetricsSnapshot {
    /// Fraction of sent parcels that were retransmissions.
    #[must_use]
    pub fn retransmission_ratio(&self) -> Option<f64> {
        if self.parcels_sent == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.parcels_retransmitted as f64 / self.parcels_sent as f64)
    }
}
