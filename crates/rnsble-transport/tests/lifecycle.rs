//! Startup, reapers, disconnection cleanup, and shutdown

mod common;

use std::time::Duration;

use common::*;

use rnsble_core::protocol;
use rnsble_transport::{
    BleConfig, BleDriver, BleMeshTransport, DriverEvent, LinkRole, MeshRouter,
    PeripheralConnection, PowerMode, Severity,
};

async fn peripheral_link(
    transport: &BleMeshTransport,
    driver: &MockDriver,
    address: rnsble_transport::BleAddress,
    seed: u8,
) {
    driver.set_role(address, LinkRole::Peripheral);
    transport
        .process_event(DriverEvent::DeviceConnected { address })
        .await;
    transport
        .process_event(DriverEvent::DataReceived {
            address,
            data: identity(seed).as_bytes().to_vec(),
        })
        .await;
}

#[tokio::test]
async fn startup_waits_for_the_host_identity() {
    let driver = MockDriver::new();
    let router = MockRouter::new(None);
    let transport = BleMeshTransport::new(
        BleConfig::default(),
        driver.clone() as std::sync::Arc<dyn BleDriver>,
        router.clone() as std::sync::Arc<dyn MeshRouter>,
    );
    transport.start().await.unwrap();
    assert!(transport.online());

    {
        let state = driver.state.lock().unwrap();
        let uuids = state.started.expect("driver started");
        assert_eq!(uuids.service, protocol::SERVICE_UUID);
        assert_eq!(uuids.rx, protocol::RX_CHARACTERISTIC_UUID);
        assert_eq!(uuids.tx, protocol::TX_CHARACTERISTIC_UUID);
        assert_eq!(uuids.identity, protocol::IDENTITY_CHARACTERISTIC_UUID);
        assert_eq!(state.power_mode, Some(PowerMode::Balanced));
        // Nothing is advertised before the identity exists.
        assert!(state.advertising.is_none());
        assert!(!state.scanning);
    }
    // Startup shed the routes a previous process left behind.
    assert_eq!(
        router.stale_route_calls.lock().unwrap().as_slice(),
        &[Duration::from_secs(60)]
    );
    assert!(!transport.announce_identity().await);

    router.publish_identity(identity(0xEE));
    assert!(transport.announce_identity().await);

    let expected_name = format!("RNS-{}", "ee".repeat(16));
    {
        let state = driver.state.lock().unwrap();
        assert_eq!(state.identity, Some(identity(0xEE)));
        assert_eq!(state.advertising.as_deref(), Some(expected_name.as_str()));
        assert!(state.scanning);
    }
    assert_eq!(transport.device_name(), Some(expected_name.as_str()));

    transport.detach().await;
}

#[tokio::test]
async fn role_configuration_gates_radio_activity() {
    let driver = MockDriver::new();
    let router = MockRouter::new(Some(identity(0xEE)));
    let config = BleConfig::default().with_central(false);
    let transport = BleMeshTransport::new(
        config,
        driver.clone() as std::sync::Arc<dyn BleDriver>,
        router as std::sync::Arc<dyn MeshRouter>,
    );
    transport.start().await.unwrap();
    assert!(transport.announce_identity().await);

    let state = driver.state.lock().unwrap();
    assert!(state.advertising.is_some());
    assert!(!state.scanning);
    drop(state);
    transport.detach().await;
}

#[tokio::test]
async fn disconnect_removes_every_trace_of_the_peer() {
    let (transport, driver, router) = online_transport(BleConfig::default()).await;
    let peer = addr("AA:BB:CC:DD:EE:FF");
    peripheral_link(&transport, &driver, peer, 0x22).await;
    assert_eq!(transport.connected_links().await.len(), 1);

    transport
        .process_event(DriverEvent::DeviceDisconnected { address: peer })
        .await;

    assert!(transport.connected_links().await.is_empty());
    let stats = transport.stats().await;
    assert_eq!(stats.connected_peers, 0);
    assert_eq!(stats.active_links, 0);
    // The platform device object is purged so rediscovery starts clean.
    assert!(driver
        .state
        .lock()
        .unwrap()
        .removed_devices
        .contains(&peer));

    // With the identity maps gone, frames from the address are dropped.
    transport
        .process_event(DriverEvent::DataReceived {
            address: peer,
            data: vec![0x03, 0, 0, 0, 1, 0xAA],
        })
        .await;
    assert!(router.inbound_packets().is_empty());

    // Repeated delivery of the disconnect is harmless.
    transport
        .process_event(DriverEvent::DeviceDisconnected { address: peer })
        .await;

    // A fresh handshake rebuilds the link from nothing.
    peripheral_link(&transport, &driver, peer, 0x22).await;
    assert_eq!(transport.connected_links().await.len(), 1);
}

#[tokio::test]
async fn reaper_discards_timed_out_reassembly_buffers() {
    let config = BleConfig::default().with_reassembly_timeout(Duration::from_millis(100));
    let (transport, driver, router) = online_transport(config).await;
    let peer = addr("AA:BB:CC:DD:EE:FF");
    peripheral_link(&transport, &driver, peer, 0x22).await;

    // First frame of a three-frame packet, then silence.
    let frames = rnsble_core::Fragmenter::new(50)
        .unwrap()
        .fragment(&vec![0x42u8; 100])
        .unwrap();
    assert_eq!(frames.len(), 3);
    transport
        .process_event(DriverEvent::DataReceived {
            address: peer,
            data: frames[0].clone(),
        })
        .await;
    assert_eq!(transport.stats().await.reassembly.pending_packets, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.reap().await;

    let stats = transport.stats().await;
    assert_eq!(stats.reassembly.pending_packets, 0);
    assert_eq!(stats.reassembly.packets_timeout, 1);
    assert!(router.inbound_packets().is_empty());
}

#[tokio::test]
async fn reaper_reclaims_connections_the_platform_dropped_silently() {
    let (transport, driver, _router) = online_transport(BleConfig::default()).await;
    let peer = addr("AA:BB:CC:DD:EE:FF");
    peripheral_link(&transport, &driver, peer, 0x22).await;
    assert_eq!(transport.connected_links().await.len(), 1);

    driver.set_peripheral_connections(vec![PeripheralConnection {
        address: peer,
        connected: false,
    }]);
    transport.reap().await;

    assert!(transport.connected_links().await.is_empty());
    assert_eq!(transport.stats().await.connected_peers, 0);
}

#[tokio::test]
async fn detach_disconnects_peers_and_stops_the_driver() {
    let (transport, driver, _router) = online_transport(BleConfig::default()).await;
    let peer = addr("AA:BB:CC:DD:EE:FF");
    peripheral_link(&transport, &driver, peer, 0x22).await;

    transport.detach().await;

    assert!(!transport.online());
    assert!(transport.connected_links().await.is_empty());
    let state = driver.state.lock().unwrap();
    assert!(state.stopped);
    assert!(!state.scanning);
    assert!(state.advertising.is_none());
    assert!(state.disconnects.contains(&peer));
    drop(state);

    // Detach is idempotent.
    transport.detach().await;
}

#[tokio::test]
async fn critical_driver_fault_takes_the_transport_offline() {
    let (transport, driver, _router) = online_transport(BleConfig::default()).await;
    let peer = addr("AA:BB:CC:DD:EE:FF");
    peripheral_link(&transport, &driver, peer, 0x22).await;

    transport
        .process_event(DriverEvent::Fault {
            severity: Severity::Critical,
            message: "adapter removed".into(),
        })
        .await;

    assert!(!transport.online());
    // Each peer saw a normal disconnect on the way down.
    assert!(transport.connected_links().await.is_empty());

    // Non-critical faults are logged without side effects.
    transport
        .process_event(DriverEvent::Fault {
            severity: Severity::Warning,
            message: "scan window shortened".into(),
        })
        .await;
}

#[tokio::test]
async fn event_pump_drains_the_driver_channel() {
    let (transport, driver, router) = online_transport(BleConfig::default()).await;
    let peer = addr("AA:BB:CC:DD:EE:FF");
    driver.set_role(peer, LinkRole::Peripheral);

    let (events_tx, events_rx) = tokio::sync::mpsc::channel(16);
    transport.spawn_event_pump(events_rx).await;

    events_tx
        .send(DriverEvent::DeviceConnected { address: peer })
        .await
        .unwrap();
    events_tx
        .send(DriverEvent::DataReceived {
            address: peer,
            data: identity(0x44).as_bytes().to_vec(),
        })
        .await
        .unwrap();
    events_tx
        .send(DriverEvent::DataReceived {
            address: peer,
            data: vec![0x03, 0, 0, 0, 1, 0x99],
        })
        .await
        .unwrap();

    // The pump runs on its own task; poll until the packet lands.
    let mut delivered = Vec::new();
    for _ in 0..50 {
        delivered = router.inbound_packets();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, vec![vec![0x99]]);
    assert_eq!(transport.connected_links().await.len(), 1);

    transport.detach().await;
}
