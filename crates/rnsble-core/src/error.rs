//! Error types for the transport core

use thiserror::Error;

use crate::address::BleAddress;
use crate::identity::IdentityHash;

// ----------------------------------------------------------------------------
// Parse Errors
// ----------------------------------------------------------------------------

/// Failure to parse a BLE MAC address.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("expected a colon-delimited 6-octet BLE address, got {0:?}")]
    InvalidFormat(String),
}

/// Failure to construct a node identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("node identity must be exactly 16 bytes, got {0}")]
    InvalidLength(usize),
}

// ----------------------------------------------------------------------------
// Fragmentation Errors
// ----------------------------------------------------------------------------

/// Errors raised by the fragmentation codec.
///
/// These never propagate to the host router; the caller drops the offending
/// packet or frame locally and the mesh layer retries end to end.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("cannot fragment an empty packet")]
    EmptyPacket,

    #[error("link mtu {mtu} leaves no payload room after the frame header")]
    MtuTooSmall { mtu: usize },

    #[error("{len} byte packet exceeds {max} frames at mtu {mtu}")]
    PacketTooLarge { len: usize, mtu: usize, max: usize },

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: &'static str },
}

// ----------------------------------------------------------------------------
// Registry Errors
// ----------------------------------------------------------------------------

/// Two handshake paths presented different identities for the same address.
///
/// The registry keeps the first binding; the caller logs the conflict rather
/// than silently replacing peer state.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("identity mismatch for {address}: kept {existing}, rejected {offered}")]
pub struct IdentityMismatch {
    pub address: BleAddress,
    pub existing: IdentityHash,
    pub offered: IdentityHash,
}
