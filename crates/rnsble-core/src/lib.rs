//! Protocol and policy core for the rnsble BLE mesh transport
//!
//! This crate holds the runtime-independent half of the transport: the
//! fragmentation codec that squeezes mesh packets through BLE link MTUs, the
//! peer registry with its identity maps and blacklist, and the connection
//! policy (scoring, direction arbitration, back-off) that turns noisy radio
//! discovery into stable connection decisions. The async lifecycle controller
//! that drives a platform driver lives in `rnsble-transport`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod address;
pub mod config;
pub mod error;
pub mod fragmentation;
pub mod identity;
pub mod peer;
pub mod policy;
pub mod protocol;
pub mod registry;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use address::BleAddress;
pub use config::{BleConfig, PowerMode};
pub use error::{AddressError, FragmentError, IdentityError, IdentityMismatch};
pub use fragmentation::{
    FrameHeader, FrameType, Fragmenter, Reassembler, ReassemblyStats, FRAME_HEADER_LEN,
};
pub use identity::{IdentityHash, NodeIdentity};
pub use peer::DiscoveredPeer;
pub use registry::{BlacklistEntry, PeerRegistry};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Largest host packet carried by the transport (the mesh-layer MTU).
pub const HW_MTU: usize = 500;

/// Advisory link bitrate reported to the host router, in bits per second.
pub const BITRATE_GUESS: u64 = 700_000;
