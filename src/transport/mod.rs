//! Byte transport boundary
//!
//! Opening, reading and reconnecting the serial link lives outside this crate.
//! The core only needs an order-preserving channel it can push frames into,
//! poll frames out of, and ask whether it is usable.

pub mod loopback;

use crate::error::TransportError;

pub trait Transport: Send + Sync {
    /// Hands one encoded frame to the link. Must not block on device throughput.
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Next complete inbound frame, if one has arrived.
    fn try_receive(&self) -> Option<Vec<u8>>;

    fn is_ready(&self) -> bool;
}
