//! The platform BLE driver contract consumed by the transport
//!
//! The transport never touches the platform Bluetooth stack directly; it
//! drives an implementation of [`BleDriver`] and consumes the serialized
//! [`DriverEvent`] stream the driver produces. Platform concerns such as
//! D-Bus registration races, GATT caching, or dual-mode adapter quirks stay
//! behind this seam.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use rnsble_core::{BleAddress, NodeIdentity, PowerMode};

// ----------------------------------------------------------------------------
// Roles and Severity
// ----------------------------------------------------------------------------

/// The GATT role the local side holds on a specific connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We initiated the connection and talk to the peer's GATT server.
    Central,
    /// The peer connected to our GATT server.
    Peripheral,
}

/// Severity attached to asynchronous driver faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Warning,
    Error,
    /// The driver is unusable; the transport goes offline.
    Critical,
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// An advertisement observed during scanning.
#[derive(Debug, Clone)]
pub struct AdvertisedDevice {
    pub address: BleAddress,
    pub name: Option<String>,
    /// Signal strength in dBm; `None` or −127 when the platform could not
    /// sample it.
    pub rssi: Option<i16>,
    /// Service UUIDs carried in the advertisement.
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer-specific data blobs keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Events the driver delivers to the transport, serialized on one channel so
/// discovery, connection, and data callbacks for an address never race.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    DeviceDiscovered(AdvertisedDevice),
    DeviceConnected { address: BleAddress },
    MtuNegotiated { address: BleAddress, mtu: usize },
    DataReceived { address: BleAddress, data: Vec<u8> },
    DeviceDisconnected { address: BleAddress },
    Fault { severity: Severity, message: String },
}

/// One entry of the driver's peripheral-side connection tracking, swept by
/// the reaper to catch disconnects the platform never signalled.
#[derive(Debug, Clone)]
pub struct PeripheralConnection {
    pub address: BleAddress,
    pub connected: bool,
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures surfaced by driver operations.
///
/// Connection-class failures are recorded against the peer and escalate
/// toward the blacklist; they never propagate to the host router.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("connect to {address} timed out")]
    ConnectTimeout { address: BleAddress },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("gatt service not found on {address}")]
    ServiceNotFound { address: BleAddress },

    #[error("notification setup failed on {address}: {reason}")]
    NotificationSetupFailed { address: BleAddress, reason: String },

    #[error("identity read failed on {address}: {reason}")]
    IdentityReadFailed { address: BleAddress, reason: String },

    #[error("peer {address} is not connected")]
    NotConnected { address: BleAddress },

    #[error("send to {address} failed: {reason}")]
    SendFailed { address: BleAddress, reason: String },

    #[error("driver closed")]
    Closed,

    #[error("adapter error: {0}")]
    Adapter(String),
}

/// Result alias for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

// ----------------------------------------------------------------------------
// Service UUIDs
// ----------------------------------------------------------------------------

/// The four UUIDs the driver registers its GATT service with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceUuids {
    pub service: Uuid,
    pub rx: Uuid,
    pub tx: Uuid,
    pub identity: Uuid,
}

impl ServiceUuids {
    /// The standard characteristic layout under a given service UUID.
    pub fn for_service(service: Uuid) -> Self {
        Self {
            service,
            rx: rnsble_core::protocol::RX_CHARACTERISTIC_UUID,
            tx: rnsble_core::protocol::TX_CHARACTERISTIC_UUID,
            identity: rnsble_core::protocol::IDENTITY_CHARACTERISTIC_UUID,
        }
    }
}

// ----------------------------------------------------------------------------
// Driver Trait
// ----------------------------------------------------------------------------

/// Operations the transport invokes on the platform BLE driver.
///
/// Operations may block on radio traffic; the transport never calls them
/// while holding its peer or fragmentation locks. The driver serializes
/// conflicting radio work internally (e.g. pausing scanning while a connect
/// is in flight).
#[async_trait]
pub trait BleDriver: Send + Sync {
    /// Bring the driver up with the GATT service layout.
    async fn start(&self, uuids: ServiceUuids) -> DriverResult<()>;

    /// Stop all radio activity and release the adapter.
    async fn stop(&self) -> DriverResult<()>;

    /// Install the 16-byte local identity served by the identity
    /// characteristic.
    async fn set_identity(&self, identity: NodeIdentity) -> DriverResult<()>;

    async fn start_scanning(&self) -> DriverResult<()>;

    async fn stop_scanning(&self) -> DriverResult<()>;

    /// Advertise the GATT service under `device_name`, optionally carrying
    /// the identity as manufacturer data for faster discovery.
    async fn start_advertising(&self, device_name: &str, identity: NodeIdentity)
        -> DriverResult<()>;

    async fn stop_advertising(&self) -> DriverResult<()>;

    /// Initiate a central-role connection.
    async fn connect(&self, address: BleAddress) -> DriverResult<()>;

    async fn disconnect(&self, address: BleAddress) -> DriverResult<()>;

    /// Transmit one frame to a connected peer, routed by role (GATT write as
    /// central, notification as peripheral).
    async fn send(&self, address: BleAddress, frame: &[u8]) -> DriverResult<()>;

    /// Read a characteristic from the peer's GATT server.
    async fn read_characteristic(
        &self,
        address: BleAddress,
        characteristic: Uuid,
    ) -> DriverResult<Vec<u8>>;

    /// Write a characteristic on the peer's GATT server (with response).
    async fn write_characteristic(
        &self,
        address: BleAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> DriverResult<()>;

    /// Subscribe to notifications on a characteristic of the peer's GATT
    /// server; notified values arrive as [`DriverEvent::DataReceived`].
    async fn subscribe_notifications(
        &self,
        address: BleAddress,
        characteristic: Uuid,
    ) -> DriverResult<()>;

    /// The local adapter address, once the platform reports it.
    fn local_address(&self) -> Option<BleAddress>;

    /// Which role the local side holds on an established connection.
    fn peer_role(&self, address: BleAddress) -> Option<LinkRole>;

    /// Request a scanning duty cycle.
    async fn set_power_mode(&self, mode: PowerMode) -> DriverResult<()>;

    /// Drop any platform-side object persisted for the address (cached
    /// device entries survive disconnects on some stacks and poison
    /// rediscovery).
    async fn remove_device(&self, address: BleAddress) -> DriverResult<()>;

    /// Snapshot of the driver's peripheral-side connection tracking, if it
    /// keeps one; used by the reaper to detect missed disconnects.
    fn peripheral_connections(&self) -> Vec<PeripheralConnection>;
}
