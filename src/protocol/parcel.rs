//! Parcel codec (encode/decode)
//!
//! A parcel is the atomic unit placed on the link, capped at
//! [`MAX_PARCEL_SIZE`] bytes. The wire format carries no type discriminant:
//! the receiver knows header-vs-data only from context (the first parcel
//! seen for an identifier vs. later ones), so this codec exposes both
//! interpretations and the receive buffer picks one from its own state.
//! All multi-byte integers are big-endian.
//!
//! # Wire Format
//!
//! ```text
//! Header parcel                        Data parcel
//! +--------+----------------------+    +--------+----------------------+
//! | 0..2   | identifier (A-Z A-Z) |    | 0..2   | identifier (A-Z A-Z) |
//! | 2..4   | total parcels (u16)  |    | 2..4   | parcel number (u16)  |
//! | 4..8   | checksum (CRC-32)    |    | 4..    | payload (<= 276)     |
//! | 8      | flags                |    +--------+----------------------+
//! | 9..    | payload (<= 271)     |
//! +--------+----------------------+
//! ```

use bytes::Bytes;

use super::{
    DATA_OVERHEAD, DATA_PAYLOAD_CAPACITY, Error, HEADER_OVERHEAD, HEADER_PAYLOAD_CAPACITY,
    MessageId, Result, checksum,
};

/// First parcel of a message: declares the parcel count, integrity checksum
/// of the transmitted payload, and the compression flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderParcel {
    id: MessageId,
    total_parcels: u16,
    checksum: u32,
    flags: u8,
    payload: Bytes,
}

impl HeaderParcel {
    /// Create a header parcel, validating payload capacity.
    pub fn new(
        id: MessageId,
        total_parcels: u16,
        checksum: u32,
        flags: u8,
        payload: Bytes,
    ) -> Result<Self> {
        if payload.len() > HEADER_PAYLOAD_CAPACITY {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: HEADER_PAYLOAD_CAPACITY,
            });
        }
        Ok(Self {
            id,
            total_parcels,
            checksum,
            flags,
            payload,
        })
    }

    /// Message identifier accessor.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Declared total parcel count (header counts as parcel 1).
    #[must_use]
    pub const fn total_parcels(&self) -> u16 {
        self.total_parcels
    }

    /// Declared CRC-32 of the transmitted payload.
    #[must_use]
    pub const fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Flags byte (low nibble = compression algorithm).
    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    /// Borrow the payload chunk.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_OVERHEAD + self.payload.len());
        bytes.extend_from_slice(self.id.as_bytes());
        bytes.extend_from_slice(&self.total_parcels.to_be_bytes());
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decode a buffer as a header parcel.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_OVERHEAD {
            return Err(Error::MalformedParcel {
                kind: "header",
                needed: HEADER_OVERHEAD,
                got: bytes.len(),
            });
        }
        let id = MessageId::from_bytes([bytes[0], bytes[1]])?;
        Ok(Self {
            id,
            total_parcels: u16::from_be_bytes([bytes[2], bytes[3]]),
            checksum: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            flags: bytes[8],
            payload: Bytes::copy_from_slice(&bytes[HEADER_OVERHEAD..]),
        })
    }
}

/// Any parcel after the first: identifier, 1-indexed number, payload chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataParcel {
    id: MessageId,
    number: u16,
    payload: Bytes,
}

impl DataParcel {
    /// Create a data parcel, validating payload capacity.
    pub fn new(id: MessageId, number: u16, payload: Bytes) -> Result<Self> {
        if payload.len() > DATA_PAYLOAD_CAPACITY {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: DATA_PAYLOAD_CAPACITY,
            });
        }
        Ok(Self {
            id,
            number,
            payload,
        })
    }

    /// Message identifier accessor.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// 1-indexed parcel number (2..=N for data parcels in practice).
    #[must_use]
    pub const fn number(&self) -> u16 {
        self.number
    }

    /// Borrow the payload chunk.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DATA_OVERHEAD + self.payload.len());
        bytes.extend_from_slice(self.id.as_bytes());
        bytes.extend_from_slice(&self.number.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decode a buffer as a data parcel.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DATA_OVERHEAD {
            return Err(Error::MalformedParcel {
                kind: "data",
                needed: DATA_OVERHEAD,
                got: bytes.len(),
            });
        }
        let id = MessageId::from_bytes([bytes[0], bytes[1]])?;
        Ok(Self {
            id,
            number: u16::from_be_bytes([bytes[2], bytes[3]]),
            payload: Bytes::copy_from_slice(&bytes[DATA_OVERHEAD..]),
        })
    }
}

/// Tagged decode result chosen by the receive buffer's own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parcel {
    /// First parcel of a message.
    Header(HeaderParcel),
    /// Subsequent parcel of a message.
    Data(DataParcel),
}

impl Parcel {
    /// Identifier carried by either variant.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        match self {
            Self::Header(header) => header.id(),
            Self::Data(data) => data.id(),
        }
    }
}

/// Extract the identifier without committing to a parcel kind.
pub fn peek_id(bytes: &[u8]) -> Result<MessageId> {
    if bytes.len() < 2 {
        return Err(Error::MalformedParcel {
            kind: "data",
            needed: DATA_OVERHEAD,
            got: bytes.len(),
        });
    }
    MessageId::from_bytes([bytes[0], bytes[1]])
}

/// Split a transmitted payload into its full encoded parcel sequence.
///
/// The first [`HEADER_PAYLOAD_CAPACITY`] bytes ride in the header parcel
/// (parcel number 1); the remainder is cut into [`DATA_PAYLOAD_CAPACITY`]
/// chunks numbered 2..=N. The checksum covers the payload exactly as
/// passed in (post-compression), so receivers verify the bytes on the
/// wire. Chunk boundaries are fixed here once; retransmission re-encodes
/// nothing.
pub fn split_into_parcels(id: MessageId, flags: u8, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let head_len = payload.len().min(HEADER_PAYLOAD_CAPACITY);
    let rest = &payload[head_len..];
    let data_count = rest.len().div_ceil(DATA_PAYLOAD_CAPACITY);
    let total = u16::try_from(1 + data_count).map_err(|_| Error::PayloadTooLarge {
        size: payload.len(),
        max: HEADER_PAYLOAD_CAPACITY + usize::from(u16::MAX - 1) * DATA_PAYLOAD_CAPACITY,
    })?;

    let declared = checksum(payload);
    let mut parcels = Vec::with_capacity(usize::from(total));
    let header = HeaderParcel::new(
        id,
        total,
        declared,
        flags,
        Bytes::copy_from_slice(&payload[..head_len]),
    )?;
    parcels.push(header.encode());

    for (index, chunk) in rest.chunks(DATA_PAYLOAD_CAPACITY).enumerate() {
        let number = u16::try_from(index + 2).expect("total fits u16");
        let parcel = DataParcel::new(id, number, Bytes::copy_from_slice(chunk))?;
        parcels.push(parcel.encode());
    }

    Ok(parcels)
}
