//! Inbound reassembly state per message identifier.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::protocol::metrics::Metrics;
use crate::protocol::{
    DataParcel, Error, HeaderParcel, MessageId, Parcel, Result, checksum, compress, peek_id,
};

/// Reassembly state for one in-flight inbound message.
///
/// The parcel map is sparse; parcels arrive in any order and numbers need
/// not be contiguous until completion. The header parcel counts as parcel 1.
#[derive(Debug)]
pub struct InboundMessage {
    total_parcels: u16,
    declared_checksum: u32,
    flags: u8,
    parcels: BTreeMap<u16, Bytes>,
    first_seen: SystemTime,
    last_activity: SystemTime,
    last_missing_request: Option<SystemTime>,
}

impl InboundMessage {
    fn new(header: &HeaderParcel, now: SystemTime) -> Self {
        let mut parcels = BTreeMap::new();
        parcels.insert(1, header.payload().clone());
        Self {
            total_parcels: header.total_parcels().max(1),
            declared_checksum: header.checksum(),
            flags: header.flags(),
            parcels,
            first_seen: now,
            last_activity: now,
            last_missing_request: None,
        }
    }

    /// Declared total parcel count.
    #[must_use]
    pub const fn total_parcels(&self) -> u16 {
        self.total_parcels
    }

    /// Time the first parcel arrived.
    #[must_use]
    pub const fn first_seen(&self) -> SystemTime {
        self.first_seen
    }

    /// Time of the most recent accepted parcel.
    #[must_use]
    pub const fn last_activity(&self) -> SystemTime {
        self.last_activity
    }

    /// Whether every declared parcel number is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.parcels.len() == usize::from(self.total_parcels)
    }

    /// Parcel numbers from 1..=N not yet received.
    #[must_use]
    pub fn missing_parcels(&self) -> Vec<u16> {
        (1..=self.total_parcels)
            .filter(|number| !self.parcels.contains_key(number))
            .collect()
    }

    /// The instant governing the missing-request cadence: the later of the
    /// last accepted parcel and the last request, so an active-but-slow
    /// transfer is not penalized.
    #[must_use]
    pub fn quiet_since(&self) -> SystemTime {
        match self.last_missing_request {
            Some(requested) => self.last_activity.max(requested),
            None => self.last_activity,
        }
    }

    fn insert_data(&mut self, parcel: &DataParcel, now: SystemTime) {
        let number = parcel.number();
        if number < 2 || number > self.total_parcels {
            debug!(
                id = %parcel.id(),
                number,
                total = self.total_parcels,
                "dropping data parcel with out-of-range number"
            );
            return;
        }
        match self.parcels.get(&number) {
            Some(existing) if existing == parcel.payload() => {
                trace!(id = %parcel.id(), number, "duplicate parcel ignored");
            }
            Some(_) => {
                debug!(id = %parcel.id(), number, "conflicting duplicate parcel, keeping first");
            }
            None => {
                self.parcels.insert(number, parcel.payload().clone());
            }
        }
        self.last_activity = now;
    }
}

/// Accumulates parcels per identifier, detects completeness, and drives
/// checksum verification on reassembly.
///
/// The wire format has no parcel-type discriminant: a buffer is decoded as
/// a header exactly when no pending record exists for its identifier, and
/// as data otherwise. That decision lives here, not in the codec.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    pending: HashMap<MessageId, InboundMessage>,
}

impl ReceiveBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode raw link bytes using pending state to pick the parcel kind,
    /// then ingest the result. Returns the identifier so the caller can
    /// check for completeness.
    pub fn accept(&mut self, bytes: &[u8], now: SystemTime) -> Result<MessageId> {
        let id = peek_id(bytes)?;
        let parcel = if self.pending.contains_key(&id) {
            Parcel::Data(DataParcel::decode(bytes)?)
        } else {
            Parcel::Header(HeaderParcel::decode(bytes)?)
        };
        self.add_parcel(&parcel, now);
        Ok(id)
    }

    /// Ingest an already-classified parcel. Duplicate parcels with
    /// identical bytes are idempotent.
    pub fn add_parcel(&mut self, parcel: &Parcel, now: SystemTime) {
        Metrics::record_parcel_received();
        match parcel {
            Parcel::Header(header) => {
                let id = header.id();
                if let Some(record) = self.pending.get_mut(&id) {
                    // Header re-delivered for a live record: parcel 1 is
                    // already present, treat as a duplicate.
                    trace!(id = %id, "duplicate header parcel ignored");
                    record.last_activity = now;
                } else {
                    debug!(
                        id = %id,
                        total = header.total_parcels(),
                        flags = header.flags(),
                        "new inbound message"
                    );
                    self.pending.insert(id, InboundMessage::new(header, now));
                }
            }
            Parcel::Data(data) => {
                if let Some(record) = self.pending.get_mut(&data.id()) {
                    record.insert_data(data, now);
                } else {
                    debug!(id = %data.id(), number = data.number(), "data parcel without record");
                }
            }
        }
    }

    /// Whether the identified message holds every declared parcel.
    #[must_use]
    pub fn is_complete(&self, id: MessageId) -> bool {
        self.pending.get(&id).is_some_and(InboundMessage::is_complete)
    }

    /// Parcel numbers still absent for the identified message.
    #[must_use]
    pub fn missing_parcels(&self, id: MessageId) -> Vec<u16> {
        self.pending
            .get(&id)
            .map(InboundMessage::missing_parcels)
            .unwrap_or_default()
    }

    /// Reassemble and verify the identified message.
    ///
    /// Concatenates parcels in numeric order, recomputes the CRC-32 over
    /// the transmitted bytes, compares against the declared checksum, and
    /// only then undoes compression. Completeness alone never implies
    /// correctness; a mismatch is reported, not silently accepted.
    pub fn assemble(&self, id: MessageId) -> Result<Bytes> {
        let Some(record) = self.pending.get(&id) else {
            return Err(Error::MissingParcels { parcels: Vec::new() });
        };
        if !record.is_complete() {
            return Err(Error::MissingParcels {
                parcels: record.missing_parcels(),
            });
        }

        let total: usize = record.parcels.values().map(Bytes::len).sum();
        let mut transmitted = Vec::with_capacity(total);
        for payload in record.parcels.values() {
            transmitted.extend_from_slice(payload);
        }

        let computed = checksum(&transmitted);
        if computed != record.declared_checksum {
            Metrics::record_checksum_failure();
            return Err(Error::ChecksumMismatch {
                declared: record.declared_checksum,
                computed,
            });
        }

        compress::decompress(Bytes::from(transmitted), record.flags)
    }

    /// Drop all state for the identified message.
    pub fn clear(&mut self, id: MessageId) {
        if self.pending.remove(&id).is_some() {
            trace!(id = %id, "inbound record cleared");
        }
    }

    /// Incomplete messages quiet for at least `gap`, each stamped with the
    /// request time so it is not re-requested before another gap passes.
    /// Returns the missing parcel numbers per message.
    pub fn due_missing_requests(
        &mut self,
        gap: Duration,
        now: SystemTime,
    ) -> Vec<(MessageId, Vec<u16>)> {
        let mut due = Vec::new();
        for (&id, record) in &mut self.pending {
            if record.is_complete() {
                continue;
            }
            let quiet = now
                .duration_since(record.quiet_since())
                .unwrap_or_default();
            if quiet >= gap {
                record.last_missing_request = Some(now);
                due.push((id, record.missing_parcels()));
            }
        }
        due.sort_by_key(|(id, _)| *id);
        due
    }

    /// Discard messages whose total age exceeds `max_age` regardless of
    /// partial progress. Returns the discarded identifiers.
    pub fn expire(&mut self, max_age: Duration, now: SystemTime) -> Vec<MessageId> {
        let mut expired: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, record)| {
                now.duration_since(record.first_seen).unwrap_or_default() >= max_age
            })
            .map(|(&id, _)| id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            debug!(id = %id, "discarding timed-out inbound message");
            Metrics::record_inbound_timeout();
            self.pending.remove(id);
        }
        expired
    }

    /// Number of messages currently buffered.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use crate::protocol::split_into_parcels;

    use super::*;

    fn id() -> MessageId {
        MessageId::parse("AK").unwrap()
    }

    fn base() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000)
    }

    fn five_parcel_payload() -> Vec<u8> {
        // 271 + 3 * 276 + 10 bytes -> five parcels.
        (0..u32::try_from(271 + 3 * 276 + 10).unwrap())
            .map(|i| u8::try_from(i % 241).unwrap())
            .collect()
    }

    #[test]
    fn accepts_out_of_order_and_assembles() {
        let payload = five_parcel_payload();
        let parcels = split_into_parcels(id(), 0, &payload).unwrap();
        assert_eq!(parcels.len(), 5);

        let mut buffer = ReceiveBuffer::new();
        let now = base();
        // Header must arrive first so the record exists; data in any order.
        buffer.accept(&parcels[0], now).unwrap();
        for index in [3, 1, 4, 2] {
            buffer.accept(&parcels[index], now).unwrap();
        }

        assert!(buffer.is_complete(id()));
        assert_eq!(buffer.assemble(id()).unwrap().as_ref(), &payload[..]);
    }

    #[test]
    fn missing_parcels_lists_absent_numbers() {
        let parcels = split_into_parcels(id(), 0, &five_parcel_payload()).unwrap();
        let mut buffer = ReceiveBuffer::new();
        let now = base();
        buffer.accept(&parcels[0], now).unwrap();
        buffer.accept(&parcels[2], now).unwrap();
        buffer.accept(&parcels[4], now).unwrap();

        assert!(!buffer.is_complete(id()));
        assert_eq!(buffer.missing_parcels(id()), vec![2, 4]);
        assert!(matches!(
            buffer.assemble(id()),
            Err(Error::MissingParcels { parcels }) if parcels == vec![2, 4]
        ));
    }

    #[test]
    fn duplicate_parcels_are_idempotent() {
        let parcels = split_into_parcels(id(), 0, &five_parcel_payload()).unwrap();
        let mut buffer = ReceiveBuffer::new();
        let now = base();
        for bytes in &parcels {
            buffer.accept(bytes, now).unwrap();
        }
        let assembled = buffer.assemble(id()).unwrap();

        buffer.accept(&parcels[2], now + Duration::from_secs(1)).unwrap();
        buffer.accept(&parcels[2], now + Duration::from_secs(2)).unwrap();
        assert!(buffer.is_complete(id()));
        assert_eq!(buffer.assemble(id()).unwrap(), assembled);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let payload = five_parcel_payload();
        let mut parcels = split_into_parcels(id(), 0, &payload).unwrap();
        // Corrupt one payload byte of parcel 3.
        let len = parcels[2].len();
        parcels[2][len - 1] ^= 0x01;

        let mut buffer = ReceiveBuffer::new();
        let now = base();
        for bytes in &parcels {
            buffer.accept(bytes, now).unwrap();
        }
        assert!(buffer.is_complete(id()));
        assert!(matches!(
            buffer.assemble(id()),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn out_of_range_numbers_are_dropped() {
        let parcels = split_into_parcels(id(), 0, &five_parcel_payload()).unwrap();
        let mut buffer = ReceiveBuffer::new();
        let now = base();
        buffer.accept(&parcels[0], now).unwrap();

        let bogus = DataParcel::new(id(), 9, Bytes::from_static(b"junk")).unwrap();
        buffer.add_parcel(&Parcel::Data(bogus), now);
        assert_eq!(buffer.missing_parcels(id()), vec![2, 3, 4, 5]);
    }

    #[test]
    fn data_without_record_is_ignored_via_add_parcel() {
        let mut buffer = ReceiveBuffer::new();
        let data = DataParcel::new(id(), 2, Bytes::from_static(b"x")).unwrap();
        buffer.add_parcel(&Parcel::Data(data), base());
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn first_buffer_for_unknown_id_decodes_as_header() {
        let parcels = split_into_parcels(id(), 0, b"hello world").unwrap();
        let mut buffer = ReceiveBuffer::new();
        let got = buffer.accept(&parcels[0], base()).unwrap();
        assert_eq!(got, id());
        assert!(buffer.is_complete(id()));
        assert_eq!(buffer.assemble(id()).unwrap().as_ref(), b"hello world");
    }

    #[test]
    fn short_buffer_is_malformed() {
        let mut buffer = ReceiveBuffer::new();
        assert!(matches!(
            buffer.accept(b"AK", base()),
            Err(Error::MalformedParcel { .. })
        ));
        assert!(matches!(
            buffer.accept(b"A", base()),
            Err(Error::MalformedParcel { .. })
        ));
    }

    #[test]
    fn missing_request_cadence_respects_gap() {
        let parcels = split_into_parcels(id(), 0, &five_parcel_payload()).unwrap();
        let mut buffer = ReceiveBuffer::new();
        let now = base();
        buffer.accept(&parcels[0], now).unwrap();
        buffer.accept(&parcels[1], now).unwrap();

        let gap = Duration::from_secs(5);
        // Too early: nothing due.
        assert!(buffer.due_missing_requests(gap, now + Duration::from_secs(4)).is_empty());

        let due = buffer.due_missing_requests(gap, now + Duration::from_secs(5));
        assert_eq!(due, vec![(id(), vec![3, 4, 5])]);

        // Re-request only after another full gap from the request.
        assert!(buffer
            .due_missing_requests(gap, now + Duration::from_secs(9))
            .is_empty());
        let due = buffer.due_missing_requests(gap, now + Duration::from_secs(10));
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn late_parcel_defers_next_missing_request() {
        let parcels = split_into_parcels(id(), 0, &five_parcel_payload()).unwrap();
        let mut buffer = ReceiveBuffer::new();
        let now = base();
        buffer.accept(&parcels[0], now).unwrap();

        let gap = Duration::from_secs(5);
        buffer.due_missing_requests(gap, now + Duration::from_secs(5));
        // Activity after the request pushes the cadence out.
        buffer
            .accept(&parcels[1], now + Duration::from_secs(8))
            .unwrap();
        assert!(buffer
            .due_missing_requests(gap, now + Duration::from_secs(12))
            .is_empty());
        assert_eq!(
            buffer
                .due_missing_requests(gap, now + Duration::from_secs(13))
                .len(),
            1
        );
    }

    #[test]
    fn expire_discards_old_messages() {
        let parcels = split_into_parcels(id(), 0, &five_parcel_payload()).unwrap();
        let mut buffer = ReceiveBuffer::new();
        let now = base();
        buffer.accept(&parcels[0], now).unwrap();
        buffer.accept(&parcels[1], now).unwrap();

        let timeout = Duration::from_secs(60);
        assert!(buffer.expire(timeout, now + Duration::from_secs(59)).is_empty());
        let expired = buffer.expire(timeout, now + Duration::from_secs(60));
        assert_eq!(expired, vec![id()]);
        assert!(!buffer.is_complete(id()));
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn compressed_message_is_inflated_on_assemble() {
        let payload = Bytes::from(vec![b'z'; 2048]);
        let (wire, flags) =
            compress::negotiate(&payload, true, &compress::CompressionConfig::default());
        assert_ne!(flags, 0);

        let parcels = split_into_parcels(id(), flags, &wire).unwrap();
        let mut buffer = ReceiveBuffer::new();
        let now = base();
        for bytes in &parcels {
            buffer.accept(bytes, now).unwrap();
        }
        assert_eq!(buffer.assemble(id()).unwrap(), payload);
    }

    #[test]
    fn unsupported_compression_is_fatal_for_the_message() {
        let parcels = split_into_parcels(id(), 0x02, b"opaque").unwrap();
        let mut buffer = ReceiveBuffer::new();
        buffer.accept(&parcels[0], base()).unwrap();
        assert!(matches!(
            buffer.assemble(id()),
            Err(Error::UnsupportedCompression { algorithm: 2 })
        ));
    }
}
