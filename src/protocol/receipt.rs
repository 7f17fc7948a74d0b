//! Receipt codec
//!
//! A receipt is the single piece of feedback the receiver sends per
//! reassembly attempt, correlated by message identifier and carried as a
//! small JSON object:
//!
//! ```text
//! {"msg_id":"AK","status":"complete"}
//! {"msg_id":"AK","status":"missing","parcels":[3,7,12]}
//! {"msg_id":"AK","status":"checksum_failed"}
//! ```

use serde::{Deserialize, Serialize};

use super::{MessageId, Result};

/// Outcome reported by the receiver for one reassembly attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// All parcels received and the checksum matched.
    Complete,
    /// Identified parcel numbers have not arrived; repeated `missing`
    /// receipts are permitted until completion or timeout.
    Missing {
        /// 1-indexed parcel numbers currently absent.
        parcels: Vec<u16>,
    },
    /// All parcels received but the reassembled bytes failed verification.
    ChecksumFailed,
}

/// Receiver feedback correlated to one in-flight message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Identifier of the message this receipt refers to.
    pub msg_id: MessageId,
    /// Reassembly outcome.
    #[serde(flatten)]
    pub status: ReceiptStatus,
}

impl Receipt {
    /// Receipt confirming full, verified delivery.
    #[must_use]
    pub const fn complete(msg_id: MessageId) -> Self {
        Self {
            msg_id,
            status: ReceiptStatus::Complete,
        }
    }

    /// Receipt requesting retransmission of specific parcels.
    #[must_use]
    pub fn missing(msg_id: MessageId, parcels: Vec<u16>) -> Self {
        Self {
            msg_id,
            status: ReceiptStatus::Missing { parcels },
        }
    }

    /// Receipt reporting an integrity failure over the full sequence.
    #[must_use]
    pub const fn checksum_failed(msg_id: MessageId) -> Self {
        Self {
            msg_id,
            status: ReceiptStatus::ChecksumFailed,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
