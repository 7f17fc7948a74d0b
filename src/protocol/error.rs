//! PLP error types

use thiserror::Error;

/// PLP protocol errors
#[derive(Error, Debug)]
pub enum Error {
    /// Parcel buffer shorter than the minimum overhead for the kind attempted
    #[error("malformed parcel: need at least {needed} bytes for {kind}, got {got}")]
    MalformedParcel {
        /// Parcel kind being decoded ("header" or "data")
        kind: &'static str,
        /// Minimum byte count for that kind
        needed: usize,
        /// Actual buffer length
        got: usize,
    },

    /// Identifier is not two ASCII uppercase letters
    #[error("invalid message identifier: {found:?}")]
    InvalidIdentifier {
        /// Offending identifier bytes
        found: [u8; 2],
    },

    /// Payload chunk exceeds the capacity of its parcel kind
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Chunk size
        size: usize,
        /// Maximum allowed for the parcel kind
        max: usize,
    },

    /// Reassembly attempted before all declared parcels arrived
    #[error("message incomplete: {} parcels missing", .parcels.len())]
    MissingParcels {
        /// 1-indexed parcel numbers not yet received
        parcels: Vec<u16>,
    },

    /// Reassembled bytes do not match the declared checksum
    #[error("checksum mismatch: declared {declared:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum declared in the header parcel
        declared: u32,
        /// Checksum recomputed over the reassembled bytes
        computed: u32,
    },

    /// Flags byte carries a compression algorithm this implementation
    /// does not recognize; the message is unrecoverable
    #[error("unsupported compression algorithm: {algorithm:#x}")]
    UnsupportedCompression {
        /// Low nibble of the flags byte
        algorithm: u8,
    },

    /// Compressed payload failed to inflate
    #[error("decompression failed: {0}")]
    Decompression(#[from] std::io::Error),

    /// Receipt JSON could not be parsed or produced
    #[error("receipt format error: {0}")]
    Receipt(#[from] serde_json::Error),

    /// No unused identifier is available (all 676 in flight or retained)
    #[error("identifier space exhausted")]
    IdentifierSpaceExhausted,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
