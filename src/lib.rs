//! PLP (Parcel Link Protocol) - Reliable message transfer over lossy half-duplex radio links
//!
//! This library turns an unreliable, size-limited byte transport (advertised
//! MTU of tens of bytes, silent packet loss, mid-transfer disconnects) into a
//! reliable, ordered, at-least-once delivery channel for arbitrarily sized
//! application messages.
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::SystemTime;
//! use bytes::Bytes;
//! use plp::{LinkConfig, LinkEngine, LinkOutput};
//!
//! let mut engine = LinkEngine::new(LinkConfig::default());
//! let now = SystemTime::now();
//!
//! // Queue a message; the engine splits it into parcels.
//! let id = engine.enqueue_message(Bytes::from_static(b"hello world"), false, now)?;
//!
//! // Drive the engine: every SendParcel must be written to the link and the
//! // outcome reported back via on_write_result.
//! for output in engine.poll(now) {
//!     if let LinkOutput::SendParcel(parcel) = output {
//!         assert!(parcel.len() <= plp::MAX_PARCEL_SIZE); // link.write(&parcel)
//!     }
//! }
//! # let _ = id;
//! # Ok::<(), plp::Error>(())
//! ```
//!
//! # Features
//!
//! - **Fixed 280-byte parcels** - header and data variants sized for
//!   constrained radio peripherals
//! - **CRC-32 integrity** - every reassembly is verified before delivery
//! - **Selective retransmission** - missing-parcel receipts resend only
//!   what was lost
//! - **Layered recovery** - per-parcel write retry, per-message missing
//!   requests, and retention/timeout sweeps

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod link;
pub mod protocol;

pub use link::{LinkConfig, LinkEngine, LinkOutput, ReceiveBuffer, TransmitQueue};
pub use protocol::{
    Algorithm, DATA_PAYLOAD_CAPACITY, Error, HEADER_PAYLOAD_CAPACITY, MAX_PARCEL_SIZE, MessageId,
    Parcel, Receipt, ReceiptStatus, Result,
};

/// PLP protocol version
pub const VERSION: &str = "1.0.0-draft";
