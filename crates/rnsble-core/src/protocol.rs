//! GATT service constants and advertising conventions

use uuid::Uuid;

use crate::identity::NodeIdentity;

// ----------------------------------------------------------------------------
// GATT Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Mesh transport GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x37145b00_442d_4a94_917f_8f42c5da28e3);

/// RX characteristic: centrals write data frames and the identity handshake here.
pub const RX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x37145b00_442d_4a94_917f_8f42c5da28e5);

/// TX characteristic: the peripheral pushes data frames here via notifications.
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x37145b00_442d_4a94_917f_8f42c5da28e4);

/// Identity characteristic: reads return exactly 16 bytes of node identity.
pub const IDENTITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x37145b00_442d_4a94_917f_8f42c5da28e6);

// ----------------------------------------------------------------------------
// Advertising Conventions
// ----------------------------------------------------------------------------

/// Device name prefix; the full name is the prefix plus 32 hex characters.
pub const DEVICE_NAME_PREFIX: &str = "RNS-";

/// Manufacturer-data company id carrying a raw 16-byte identity blob.
pub const MANUFACTURER_DATA_ID: u16 = 0xFFFF;

/// RSSI value drivers report when the platform could not sample the signal.
pub const RSSI_UNKNOWN: i16 = -127;

/// Build the advertised device name for an identity: `RNS-<32 hex chars>`.
pub fn device_name(identity: &NodeIdentity) -> String {
    format!("{}{}", DEVICE_NAME_PREFIX, hex::encode(identity.as_bytes()))
}

/// Recover a peer identity from an advertised device name.
///
/// Accepts only the exact `RNS-` plus 32 lowercase hex character form; any
/// other name yields `None`.
pub fn identity_from_device_name(name: &str) -> Option<NodeIdentity> {
    let hex_part = name.strip_prefix(DEVICE_NAME_PREFIX)?;
    if hex_part.len() != NodeIdentity::LEN * 2 {
        return None;
    }
    if !hex_part
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return None;
    }
    let bytes = hex::decode(hex_part).ok()?;
    NodeIdentity::from_bytes(&bytes).ok()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
