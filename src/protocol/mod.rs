//! PLP wire format core
//!
//! This module provides the parcel wire format, receipt codec, compression
//! negotiation, and message identifiers. Everything here is stateless; the
//! per-link state machines live in [`crate::link`].

pub mod compress;
mod error;
mod id;
pub mod metrics;
mod parcel;
mod receipt;

pub use compress::{Algorithm, CompressionConfig};
pub use error::{Error, Result};
pub use id::MessageId;
pub use parcel::{DataParcel, HeaderParcel, Parcel, peek_id, split_into_parcels};
pub use receipt::{Receipt, ReceiptStatus};

/// Largest parcel placed on the link, empirically the biggest size that
/// avoids link-layer buffer overflow on constrained peripherals.
pub const MAX_PARCEL_SIZE: usize = 280;

/// Wire overhead of a header parcel (identifier + total + checksum + flags).
pub const HEADER_OVERHEAD: usize = 9;

/// Wire overhead of a data parcel (identifier + parcel number).
pub const DATA_OVERHEAD: usize = 4;

/// Payload capacity of a header parcel.
pub const HEADER_PAYLOAD_CAPACITY: usize = MAX_PARCEL_SIZE - HEADER_OVERHEAD;

/// Payload capacity of a data parcel.
pub const DATA_PAYLOAD_CAPACITY: usize = MAX_PARCEL_SIZE - DATA_OVERHEAD;

/// Compute the CRC-32 integrity checksum over transmitted payload bytes.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}
