//! Node identity and the stable peer key derived from it

use core::fmt;

use sha2::{Digest, Sha256};

use crate::error::IdentityError;

// ----------------------------------------------------------------------------
// Node Identity
// ----------------------------------------------------------------------------

/// The host-supplied 16-byte stable identifier of a node.
///
/// The transport treats the value as opaque: it is advertised (through the
/// device name and manufacturer data), exchanged during the connection
/// handshake, and hashed into the key that peer links and fragmentation
/// buffers are tracked under.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdentity([u8; 16]);

impl NodeIdentity {
    /// Length of a node identity in bytes.
    pub const LEN: usize = 16;

    /// Create an identity from exactly 16 bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create an identity from a byte slice, which must be exactly 16 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let octets: [u8; 16] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self(octets))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive the stable peer key for this identity.
    ///
    /// Peer links, fragmenters, and reassembly buffers are all looked up
    /// under this key, so per-peer state survives BLE MAC rotation.
    pub fn identity_hash(&self) -> IdentityHash {
        let digest = Sha256::digest(self.0);
        let mut key = [0u8; IdentityHash::LEN];
        key.copy_from_slice(&digest[..IdentityHash::LEN]);
        IdentityHash(key)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({})", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Identity Hash
// ----------------------------------------------------------------------------

/// The 16-hex-character peer key: the leading bytes of `sha256(identity)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityHash([u8; 8]);

impl IdentityHash {
    /// Length of the key in bytes (16 hex characters when rendered).
    pub const LEN: usize = 8;

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash({})", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
