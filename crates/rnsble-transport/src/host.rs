//! The seam toward the host mesh router

use std::time::Duration;

use rnsble_core::{BleAddress, IdentityHash, NodeIdentity};

// ----------------------------------------------------------------------------
// Link Descriptor
// ----------------------------------------------------------------------------

/// Participation level of a logical link in the mesh above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Routing, announce propagation, and transport all enabled.
    Full,
}

/// What the host router learns about the logical link a packet arrived on.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    /// Stable peer key; survives MAC rotation.
    pub identity_hash: IdentityHash,
    /// Current BLE address of the peer.
    pub address: BleAddress,
    /// Advertised peer name, or a placeholder derived from the address.
    pub name: String,
    pub mode: LinkMode,
}

// ----------------------------------------------------------------------------
// Mesh Router Trait
// ----------------------------------------------------------------------------

/// Callbacks into the host mesh router.
///
/// The router calls [`crate::BleMeshTransport::outbound`] with packets to
/// fan out; the transport calls back here with reassembled inbound packets
/// and for the pieces of host state it needs.
pub trait MeshRouter: Send + Sync {
    /// Deliver a fully reassembled packet that arrived on `link`.
    fn inbound(&self, data: Vec<u8>, link: &LinkInfo);

    /// The 16-byte node identity, once the router has published it. The
    /// transport polls this at startup; publication is guaranteed.
    fn local_identity(&self) -> Option<NodeIdentity>;

    /// Remove routes received over this transport whose timestamp is unset
    /// or older than `max_age`. Invoked once at startup: route entries that
    /// a previous process persisted refer to connections that no longer
    /// exist and would otherwise shadow fresh path discovery.
    fn drop_stale_routes(&self, max_age: Duration);
}
