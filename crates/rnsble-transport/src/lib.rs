//! Dual-role BLE mesh transport adapter
//!
//! This crate carries opaque mesh packets between nearby nodes over BLE GATT.
//! It sits below a host mesh router ([`MeshRouter`]) and above a platform BLE
//! driver ([`BleDriver`]), and owns everything in between: the peer identity
//! and connection-direction protocol that makes two devices arrive at exactly
//! one bidirectional logical link, the per-peer lifecycle across scanning,
//! advertising, both connection roles, data exchange and teardown, and the
//! reapers that keep stale state from wedging the adapter.
//!
//! The runtime-independent protocol and policy logic (fragmentation codec,
//! peer registry, scoring) lives in `rnsble-core` and is re-exported here
//! where it is part of the public surface.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod driver;
pub mod error;
pub mod host;
pub mod link;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use driver::{
    AdvertisedDevice, BleDriver, DriverError, DriverEvent, DriverResult, LinkRole,
    PeripheralConnection, ServiceUuids, Severity,
};
pub use error::TransportError;
pub use host::{LinkInfo, LinkMode, MeshRouter};
pub use link::BlePeerLink;
pub use transport::{BleMeshTransport, TransportStats};

pub use rnsble_core::{
    BleAddress, BleConfig, IdentityHash, NodeIdentity, PowerMode, BITRATE_GUESS, HW_MTU,
};

/// Convenience result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
