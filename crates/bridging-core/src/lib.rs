//! bridging-core: shared protocol library for the bridge/gateway tunnel pair.
//!
//! Provides the packet and args wire types, the gzip+JSON envelope codec,
//! and the common error type. Used symmetrically by both processes.

pub mod codec;
pub mod error;
pub mod packet;

// Re-export commonly used items at crate root.
pub use codec::Codec;
pub use error::{BridgingError, BridgingResult};
pub use packet::{Args, Headers, Packet, PacketMethod};
