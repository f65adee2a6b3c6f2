//! Transport configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::protocol;

// ----------------------------------------------------------------------------
// Power Mode
// ----------------------------------------------------------------------------

/// Scanning duty cycle requested from the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerMode {
    /// Continuous scanning.
    Aggressive,
    /// Intermittent scanning.
    #[default]
    Balanced,
    /// Minimal scanning.
    Saver,
}

impl PowerMode {
    /// Parse a configuration string, `None` for unrecognized values.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "aggressive" => Some(Self::Aggressive),
            "balanced" => Some(Self::Balanced),
            "saver" => Some(Self::Saver),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE mesh transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleConfig {
    /// GATT service UUID to advertise and scan for.
    pub service_uuid: Uuid,
    /// Advertised device name; auto-generated from the node identity if unset.
    pub device_name: Option<String>,
    /// Seconds between discovery scans (driver hint).
    pub discovery_interval: Duration,
    /// Maximum simultaneous peer connections.
    pub max_connections: usize,
    /// Minimum advertisement signal strength in dBm.
    pub min_rssi: i16,
    /// Timeout for connection establishment and handshake reads.
    pub connection_timeout: Duration,
    /// Delay before GATT service discovery after connecting (driver hint).
    pub service_discovery_delay: Duration,
    /// Scanning duty cycle.
    pub power_mode: PowerMode,
    /// Whether to scan and initiate connections.
    pub enable_central: bool,
    /// Whether to advertise and accept connections.
    pub enable_peripheral: bool,
    /// Bound on the discovery cache.
    pub max_discovered_peers: usize,
    /// How often a connected peer may be rotated out for a better candidate.
    pub connection_rotation_interval: Duration,
    /// Base blacklist duration after repeated failures.
    pub connection_retry_backoff: Duration,
    /// Failure count that triggers blacklisting.
    pub max_connection_failures: u32,
    /// How long an incomplete reassembly buffer may sit idle.
    pub reassembly_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            device_name: None,
            discovery_interval: Duration::from_secs(5),
            max_connections: 7,
            min_rssi: -85,
            connection_timeout: Duration::from_secs(30),
            service_discovery_delay: Duration::from_millis(1500),
            power_mode: PowerMode::Balanced,
            enable_central: true,
            enable_peripheral: true,
            max_discovered_peers: 100,
            connection_rotation_interval: Duration::from_secs(600),
            connection_retry_backoff: Duration::from_secs(60),
            max_connection_failures: 3,
            reassembly_timeout: Duration::from_secs(30),
        }
    }
}

impl BleConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum simultaneous connections.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the minimum acceptable RSSI.
    pub fn with_min_rssi(mut self, min_rssi: i16) -> Self {
        self.min_rssi = min_rssi;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the power mode.
    pub fn with_power_mode(mut self, power_mode: PowerMode) -> Self {
        self.power_mode = power_mode;
        self
    }

    /// Enable or disable the central role.
    pub fn with_central(mut self, enabled: bool) -> Self {
        self.enable_central = enabled;
        self
    }

    /// Enable or disable the peripheral role.
    pub fn with_peripheral(mut self, enabled: bool) -> Self {
        self.enable_peripheral = enabled;
        self
    }

    /// Set the reassembly timeout.
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Coerce out-of-range values back to usable ones, warning as the
    /// original operator-facing knobs do rather than refusing to start.
    pub fn sanitized(mut self) -> Self {
        if self.max_connections == 0 {
            warn!("max_connections of 0 is unusable, using 1");
            self.max_connections = 1;
        }
        if self.max_discovered_peers == 0 {
            warn!("max_discovered_peers of 0 is unusable, using 100");
            self.max_discovered_peers = 100;
        }
        if self.reassembly_timeout.is_zero() {
            warn!("reassembly_timeout of 0 would drop every partial packet, using 30s");
            self.reassembly_timeout = Duration::from_secs(30);
        }
        self
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
