//! Per-link protocol state machines
//!
//! Everything in this module is owned by a single coordinating
//! [`LinkEngine`] per connected peer: the transmit queue (outbound
//! send/retry/retention), the receive buffer (inbound reassembly), and the
//! housekeeping sweep that recovers from lost receipts. Multiple peers run
//! independent engines; there is no ambient global state.
//!
//! All time-dependent operations take an explicit `now` so schedulers and
//! tests can inject their own clock.

mod engine;
mod housekeeping;
mod receive;
mod transmit;

pub use engine::{LinkConfig, LinkEngine, LinkOutput};
pub use housekeeping::{HousekeepingConfig, HousekeepingEvent, run_sweep};
pub use receive::{InboundMessage, ReceiveBuffer};
pub use transmit::{TransmitConfig, TransmitEvent, TransmitQueue};
