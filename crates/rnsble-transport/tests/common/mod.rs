//! Scripted driver and router doubles for transport integration tests
//!
//! The mock driver records every operation the transport invokes and serves
//! canned responses, so tests can walk the lifecycle by feeding events
//! through `BleMeshTransport::process_event` without any radio hardware.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use rnsble_core::protocol;
use rnsble_transport::{
    AdvertisedDevice, BleAddress, BleConfig, BleDriver, BleMeshTransport, DriverError,
    DriverResult, LinkInfo, LinkRole, MeshRouter, NodeIdentity, PeripheralConnection, PowerMode,
    ServiceUuids,
};

// ----------------------------------------------------------------------------
// Mock Driver
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct MockDriverState {
    pub started: Option<ServiceUuids>,
    pub stopped: bool,
    pub identity: Option<NodeIdentity>,
    pub scanning: bool,
    pub advertising: Option<String>,
    pub power_mode: Option<PowerMode>,
    pub local_address: Option<BleAddress>,
    pub roles: HashMap<BleAddress, LinkRole>,
    pub identity_reads: HashMap<BleAddress, Vec<u8>>,
    pub failing_identity_reads: HashSet<BleAddress>,
    pub connects: Vec<BleAddress>,
    pub disconnects: Vec<BleAddress>,
    pub removed_devices: Vec<BleAddress>,
    pub sent: Vec<(BleAddress, Vec<u8>)>,
    pub written: Vec<(BleAddress, Uuid, Vec<u8>)>,
    pub subscriptions: Vec<(BleAddress, Uuid)>,
    pub fail_sends_after: Option<usize>,
    pub peripheral_connections: Vec<PeripheralConnection>,
}

pub struct MockDriver {
    pub state: Mutex<MockDriverState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockDriverState::default()),
        })
    }

    pub fn set_role(&self, address: BleAddress, role: LinkRole) {
        self.state.lock().unwrap().roles.insert(address, role);
    }

    pub fn set_identity_read(&self, address: BleAddress, value: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .identity_reads
            .insert(address, value);
    }

    pub fn fail_identity_read(&self, address: BleAddress) {
        self.state
            .lock()
            .unwrap()
            .failing_identity_reads
            .insert(address);
    }

    pub fn set_local_address(&self, address: BleAddress) {
        self.state.lock().unwrap().local_address = Some(address);
    }

    pub fn set_peripheral_connections(&self, connections: Vec<PeripheralConnection>) {
        self.state.lock().unwrap().peripheral_connections = connections;
    }

    pub fn fail_sends_after(&self, successful: usize) {
        self.state.lock().unwrap().fail_sends_after = Some(successful);
    }

    pub fn sent_to(&self, address: BleAddress) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(to, _)| *to == address)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

#[async_trait]
impl BleDriver for MockDriver {
    async fn start(&self, uuids: ServiceUuids) -> DriverResult<()> {
        self.state.lock().unwrap().started = Some(uuids);
        Ok(())
    }

    async fn stop(&self) -> DriverResult<()> {
        self.state.lock().unwrap().stopped = true;
        Ok(())
    }

    async fn set_identity(&self, identity: NodeIdentity) -> DriverResult<()> {
        self.state.lock().unwrap().identity = Some(identity);
        Ok(())
    }

    async fn start_scanning(&self) -> DriverResult<()> {
        self.state.lock().unwrap().scanning = true;
        Ok(())
    }

    async fn stop_scanning(&self) -> DriverResult<()> {
        self.state.lock().unwrap().scanning = false;
        Ok(())
    }

    async fn start_advertising(
        &self,
        device_name: &str,
        _identity: NodeIdentity,
    ) -> DriverResult<()> {
        self.state.lock().unwrap().advertising = Some(device_name.to_string());
        Ok(())
    }

    async fn stop_advertising(&self) -> DriverResult<()> {
        self.state.lock().unwrap().advertising = None;
        Ok(())
    }

    async fn connect(&self, address: BleAddress) -> DriverResult<()> {
        self.state.lock().unwrap().connects.push(address);
        Ok(())
    }

    async fn disconnect(&self, address: BleAddress) -> DriverResult<()> {
        self.state.lock().unwrap().disconnects.push(address);
        Ok(())
    }

    async fn send(&self, address: BleAddress, frame: &[u8]) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = state.fail_sends_after {
            if state.sent.len() >= limit {
                return Err(DriverError::SendFailed {
                    address,
                    reason: "scripted failure".into(),
                });
            }
        }
        state.sent.push((address, frame.to_vec()));
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: BleAddress,
        characteristic: Uuid,
    ) -> DriverResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if state.failing_identity_reads.contains(&address) {
            return Err(DriverError::IdentityReadFailed {
                address,
                reason: "scripted failure".into(),
            });
        }
        if characteristic == protocol::IDENTITY_CHARACTERISTIC_UUID {
            if let Some(value) = state.identity_reads.get(&address) {
                return Ok(value.clone());
            }
        }
        Err(DriverError::ServiceNotFound { address })
    }

    async fn write_characteristic(
        &self,
        address: BleAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> DriverResult<()> {
        self.state
            .lock()
            .unwrap()
            .written
            .push((address, characteristic, value.to_vec()));
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        address: BleAddress,
        characteristic: Uuid,
    ) -> DriverResult<()> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .push((address, characteristic));
        Ok(())
    }

    fn local_address(&self) -> Option<BleAddress> {
        self.state.lock().unwrap().local_address
    }

    fn peer_role(&self, address: BleAddress) -> Option<LinkRole> {
        self.state.lock().unwrap().roles.get(&address).copied()
    }

    async fn set_power_mode(&self, mode: PowerMode) -> DriverResult<()> {
        self.state.lock().unwrap().power_mode = Some(mode);
        Ok(())
    }

    async fn remove_device(&self, address: BleAddress) -> DriverResult<()> {
        self.state.lock().unwrap().removed_devices.push(address);
        Ok(())
    }

    fn peripheral_connections(&self) -> Vec<PeripheralConnection> {
        self.state.lock().unwrap().peripheral_connections.clone()
    }
}

// ----------------------------------------------------------------------------
// Mock Router
// ----------------------------------------------------------------------------

pub struct MockRouter {
    identity: Mutex<Option<NodeIdentity>>,
    pub inbound: Mutex<Vec<(Vec<u8>, LinkInfo)>>,
    pub stale_route_calls: Mutex<Vec<Duration>>,
}

impl MockRouter {
    pub fn new(identity: Option<NodeIdentity>) -> Arc<Self> {
        Arc::new(Self {
            identity: Mutex::new(identity),
            inbound: Mutex::new(Vec::new()),
            stale_route_calls: Mutex::new(Vec::new()),
        })
    }

    pub fn publish_identity(&self, identity: NodeIdentity) {
        *self.identity.lock().unwrap() = Some(identity);
    }

    pub fn inbound_packets(&self) -> Vec<Vec<u8>> {
        self.inbound
            .lock()
            .unwrap()
            .iter()
            .map(|(data, _)| data.clone())
            .collect()
    }
}

impl MeshRouter for MockRouter {
    fn inbound(&self, data: Vec<u8>, link: &LinkInfo) {
        self.inbound.lock().unwrap().push((data, link.clone()));
    }

    fn local_identity(&self) -> Option<NodeIdentity> {
        *self.identity.lock().unwrap()
    }

    fn drop_stale_routes(&self, max_age: Duration) {
        self.stale_route_calls.lock().unwrap().push(max_age);
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

pub fn addr(s: &str) -> BleAddress {
    s.parse().unwrap()
}

pub fn identity(seed: u8) -> NodeIdentity {
    NodeIdentity::new([seed; 16])
}

pub fn advertisement(address: BleAddress, name: Option<&str>, rssi: i16) -> AdvertisedDevice {
    AdvertisedDevice {
        address,
        name: name.map(str::to_string),
        rssi: Some(rssi),
        service_uuids: vec![protocol::SERVICE_UUID],
        manufacturer_data: HashMap::new(),
    }
}

/// A started transport over fresh mocks, with the local identity published.
pub async fn online_transport(
    config: BleConfig,
) -> (BleMeshTransport, Arc<MockDriver>, Arc<MockRouter>) {
    let driver = MockDriver::new();
    let router = MockRouter::new(Some(identity(0xEE)));
    let transport = BleMeshTransport::new(
        config,
        driver.clone() as Arc<dyn BleDriver>,
        router.clone() as Arc<dyn MeshRouter>,
    );
    transport.start().await.expect("transport start");
    assert!(transport.announce_identity().await);
    (transport, driver, router)
}
