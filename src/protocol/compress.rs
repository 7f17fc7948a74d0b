//! Compression negotiation
//!
//! The sender decides once, before the first transmission, whether a
//! payload travels compressed. The decision is deliberately conservative:
//! small payloads, peers that never advertised support, and content that
//! is already compressed all ship verbatim. When compression does run, the
//! result is kept only if strictly smaller, so the flags byte always
//! describes the bytes actually on the wire - the integrity checksum is
//! computed over transmitted bytes, not the logical payload.
//!
//! The receive side is strict: an unrecognized nonzero algorithm nibble is
//! an error, never a silent pass-through.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use tracing::{debug, trace};

use super::{Error, Result};

/// Payloads below this size are never worth compressing.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 300;

/// Mask selecting the algorithm nibble of the flags byte; the high nibble
/// is reserved and ignored on read.
const ALGORITHM_MASK: u8 = 0x0F;

/// Compression algorithms carried in the flags byte's low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    /// DEFLATE (RFC 1951), the only algorithm currently assigned.
    Deflate = 1,
}

impl Algorithm {
    /// Decode the algorithm nibble: `None` for uncompressed, an error for
    /// reserved values 2-15.
    pub fn from_flags(flags: u8) -> Result<Option<Self>> {
        match flags & ALGORITHM_MASK {
            0 => Ok(None),
            1 => Ok(Some(Self::Deflate)),
            algorithm => Err(Error::UnsupportedCompression { algorithm }),
        }
    }

    /// Flags byte value announcing this algorithm.
    #[must_use]
    pub const fn as_flags(self) -> u8 {
        self as u8
    }

    /// Handshake capability token peers use to advertise support, e.g.
    /// `compression:deflate`.
    #[must_use]
    pub const fn capability_token(self) -> &'static str {
        match self {
            Self::Deflate => "compression:deflate",
        }
    }
}

/// Tunables for the sender-side decision.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum payload size considered for compression.
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// Decide and apply compression for an outbound payload.
///
/// Returns the bytes to put on the wire and the flags byte describing
/// them. The two always agree: if the compressed form is not strictly
/// smaller it is discarded and the original ships with flags `0x00`.
#[must_use]
pub fn negotiate(payload: &Bytes, peer_supports_compression: bool, config: &CompressionConfig) -> (Bytes, u8) {
    if payload.len() < config.threshold {
        trace!(len = payload.len(), "payload below compression threshold");
        return (payload.clone(), 0);
    }
    if !peer_supports_compression {
        trace!("peer does not advertise compression support");
        return (payload.clone(), 0);
    }
    if looks_precompressed(payload) {
        debug!(len = payload.len(), "skipping compression of precompressed container");
        return (payload.clone(), 0);
    }

    match deflate(payload) {
        Ok(compressed) if compressed.len() < payload.len() => {
            debug!(
                raw = payload.len(),
                compressed = compressed.len(),
                "sending payload compressed"
            );
            (Bytes::from(compressed), Algorithm::Deflate.as_flags())
        }
        Ok(compressed) => {
            debug!(
                raw = payload.len(),
                compressed = compressed.len(),
                "compression not smaller, sending original"
            );
            (payload.clone(), 0)
        }
        Err(err) => {
            debug!(error = %err, "compression failed, sending original");
            (payload.clone(), 0)
        }
    }
}

/// Undo compression on a reassembled payload according to its flags byte.
pub fn decompress(payload: Bytes, flags: u8) -> Result<Bytes> {
    match Algorithm::from_flags(flags)? {
        None => Ok(payload),
        Some(Algorithm::Deflate) => {
            let mut decoder = DeflateDecoder::new(payload.as_ref());
            let mut out = Vec::with_capacity(payload.len().saturating_mul(2));
            decoder.read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
    }
}

/// Heuristic content sniffing for containers that are already compressed.
fn looks_precompressed(payload: &[u8]) -> bool {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF];
    const GZIP: &[u8] = &[0x1F, 0x8B];

    payload.starts_with(PNG) || payload.starts_with(JPEG) || payload.starts_with(GZIP)
}

fn deflate(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(len: usize) -> Bytes {
        Bytes::from(vec![b'a'; len])
    }

    #[test]
    fn below_threshold_ships_verbatim() {
        let payload = compressible(DEFAULT_COMPRESSION_THRESHOLD - 1);
        let (wire, flags) = negotiate(&payload, true, &CompressionConfig::default());
        assert_eq!(flags, 0);
        assert_eq!(wire, payload);
    }

    #[test]
    fn unsupporting_peer_ships_verbatim() {
        let payload = compressible(1024);
        let (wire, flags) = negotiate(&payload, false, &CompressionConfig::default());
        assert_eq!(flags, 0);
        assert_eq!(wire, payload);
    }

    #[test]
    fn precompressed_containers_ship_verbatim() {
        for magic in [
            vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A],
            vec![0xFF, 0xD8, 0xFF],
            vec![0x1F, 0x8B],
        ] {
            let mut payload = magic;
            payload.resize(1024, 0x55);
            let payload = Bytes::from(payload);
            let (wire, flags) = negotiate(&payload, true, &CompressionConfig::default());
            assert_eq!(flags, 0);
            assert_eq!(wire, payload);
        }
    }

    #[test]
    fn compressible_payload_roundtrips() {
        let payload = compressible(2048);
        let (wire, flags) = negotiate(&payload, true, &CompressionConfig::default());
        assert_eq!(flags, Algorithm::Deflate.as_flags());
        assert!(wire.len() < payload.len());
        assert_eq!(decompress(wire, flags).unwrap(), payload);
    }

    #[test]
    fn incompressible_payload_keeps_original_bytes() {
        // A high-entropy byte pattern DEFLATE cannot shrink.
        let mut state = 0x9E37_79B9_u32;
        let payload: Vec<u8> = (0..1024)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                u8::try_from(state >> 24).unwrap()
            })
            .collect();
        let payload = Bytes::from(payload);
        let (wire, flags) = negotiate(&payload, true, &CompressionConfig::default());
        assert_eq!(flags, 0);
        assert_eq!(wire, payload);
    }

    #[test]
    fn zero_flags_pass_through_untouched() {
        let payload = Bytes::from_static(b"opaque binary");
        assert_eq!(decompress(payload.clone(), 0x00).unwrap(), payload);
        // Reserved high nibble does not participate in dispatch.
        assert_eq!(decompress(payload.clone(), 0x10).unwrap(), payload);
    }

    #[test]
    fn reserved_algorithms_are_rejected() {
        for flags in 2..=15u8 {
            assert!(matches!(
                decompress(Bytes::from_static(b"x"), flags),
                Err(Error::UnsupportedCompression { algorithm }) if algorithm == flags
            ));
        }
    }

    #[test]
    fn corrupt_deflate_stream_is_an_error() {
        let result = decompress(Bytes::from_static(b"not deflate"), Algorithm::Deflate.as_flags());
        assert!(matches!(result, Err(Error::Decompression(_))));
    }
}
