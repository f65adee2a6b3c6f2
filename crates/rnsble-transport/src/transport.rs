//! Dual-role BLE peer lifecycle controller
//!
//! One instance owns all transport state; there are no process-wide
//! singletons. Driver callbacks arrive serialized on a single event channel,
//! the host router calls in from its own tasks, and periodic work (the
//! reaper, the identity waiter) runs on spawned tasks.
//!
//! Lock ordering, always: the peer lock first, then the fragmentation lock.
//! Neither lock is ever held across a driver operation; state is snapshotted
//! under the lock and the lock released before the radio is touched.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use rnsble_core::fragmentation::{Fragmenter, Reassembler, ReassemblyStats};
use rnsble_core::protocol::{self, RSSI_UNKNOWN};
use rnsble_core::registry::PeerRegistry;
use rnsble_core::{BleAddress, BleConfig, IdentityHash, NodeIdentity, HW_MTU};

use crate::driver::{
    AdvertisedDevice, BleDriver, DriverEvent, LinkRole, ServiceUuids, Severity,
};
use crate::error::TransportError;
use crate::host::{LinkInfo, MeshRouter};
use crate::link::BlePeerLink;

// ----------------------------------------------------------------------------
// Timing Constants
// ----------------------------------------------------------------------------

/// Period of the reaper sweeping stale reassembly buffers and dead
/// peripheral connections.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the host router to publish its identity.
const IDENTITY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Routes persisted by a previous process are stale past this age.
const STALE_ROUTE_AGE: Duration = Duration::from_secs(60);

/// Discovered peers unseen for this long are dropped from the cache.
const STALE_PEER_AGE: Duration = Duration::from_secs(60);

/// Upper bound on a single frame transmission.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait per peer while disconnecting during shutdown.
const DISCONNECT_WAIT: Duration = Duration::from_secs(2);

/// MTU assumed for a peripheral-role link until the driver reports the
/// negotiated value (the BLE 4.0 floor).
const FALLBACK_MTU: usize = 23;

/// Back-off after each failed notification subscription attempt.
const NOTIFY_RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_secs(1),
];

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// Everything behind the peer lock: the registry and the live links.
struct PeerState {
    registry: PeerRegistry,
    links: HashMap<IdentityHash, Arc<BlePeerLink>>,
}

/// Everything behind the fragmentation lock, keyed by identity hash.
struct CodecState {
    fragmenters: HashMap<IdentityHash, Fragmenter>,
    reassemblers: HashMap<IdentityHash, Reassembler>,
}

struct Shared {
    config: BleConfig,
    driver: Arc<dyn BleDriver>,
    router: Arc<dyn MeshRouter>,
    peers: Mutex<PeerState>,
    codec: Mutex<CodecState>,
    online: AtomicBool,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    device_name: OnceLock<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Snapshot of transport-wide counters.
#[derive(Debug, Clone, Copy)]
pub struct TransportStats {
    pub online: bool,
    pub connected_peers: usize,
    pub discovered_peers: usize,
    pub active_links: usize,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub reassembly: ReassemblyStats,
}

// ----------------------------------------------------------------------------
// Transport Controller
// ----------------------------------------------------------------------------

/// The dual-role BLE peer manager.
///
/// Orchestrates scanning and advertising, the identity handshake in both
/// roles, per-peer link creation and teardown, the outbound fan-out and
/// inbound reassembly paths, and the periodic reapers.
#[derive(Clone)]
pub struct BleMeshTransport {
    inner: Arc<Shared>,
}

impl BleMeshTransport {
    /// Create a transport over a driver and a host router.
    pub fn new(
        config: BleConfig,
        driver: Arc<dyn BleDriver>,
        router: Arc<dyn MeshRouter>,
    ) -> Self {
        let config = config.sanitized();
        let max_discovered = config.max_discovered_peers;
        Self {
            inner: Arc::new(Shared {
                config,
                driver,
                router,
                peers: Mutex::new(PeerState {
                    registry: PeerRegistry::new(max_discovered),
                    links: HashMap::new(),
                }),
                codec: Mutex::new(CodecState {
                    fragmenters: HashMap::new(),
                    reassemblers: HashMap::new(),
                }),
                online: AtomicBool::new(false),
                rx_bytes: AtomicU64::new(0),
                tx_bytes: AtomicU64::new(0),
                device_name: OnceLock::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &BleConfig {
        &self.inner.config
    }

    /// Whether the transport is online.
    pub fn online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// BLE links are point-to-point; the shared-medium ingress limiting the
    /// host applies to broadcast interfaces does not apply here.
    pub fn ingress_limit(&self) -> bool {
        false
    }

    /// Advisory link bitrate reported to the host router.
    pub fn bitrate(&self) -> u64 {
        rnsble_core::BITRATE_GUESS
    }

    /// The advertised device name, once the identity has been published.
    pub fn device_name(&self) -> Option<&str> {
        self.inner.device_name.get().map(String::as_str)
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Bring the transport online.
    ///
    /// Starts the driver with the GATT service layout and spawns the waiter
    /// that polls for the host identity; advertising and scanning begin once
    /// the identity is published. Call [`Self::spawn_event_pump`] with the
    /// driver's event channel to begin processing events.
    pub async fn start(&self) -> Result<(), TransportError> {
        let uuids = ServiceUuids::for_service(self.inner.config.service_uuid);
        info!(service = %uuids.service, "starting ble transport");
        self.inner.driver.start(uuids).await?;
        self.inner
            .driver
            .set_power_mode(self.inner.config.power_mode)
            .await?;

        // A previous process may have left routes pointing at connections
        // that no longer exist; have the host shed them before fresh
        // announcements arrive.
        self.inner.router.drop_stale_routes(STALE_ROUTE_AGE);

        self.inner.online.store(true, Ordering::SeqCst);

        let transport = self.clone();
        let waiter = tokio::spawn(async move {
            debug!("waiting for the host router to publish its identity");
            while transport.online() {
                if transport.announce_identity().await {
                    break;
                }
                tokio::time::sleep(IDENTITY_POLL_INTERVAL).await;
            }
        });
        self.inner.tasks.lock().await.push(waiter);

        info!("ble transport online");
        Ok(())
    }

    /// Spawn the task that drains the driver's event channel and runs the
    /// periodic reaper. Embedders driving events by hand (tests, simulators)
    /// can skip this and call [`Self::process_event`] directly.
    pub async fn spawn_event_pump(&self, mut events: mpsc::Receiver<DriverEvent>) {
        let transport = self.clone();
        let handle = tokio::spawn(async move {
            let mut reaper = interval(REAPER_INTERVAL);
            // The first tick of a tokio interval fires immediately.
            reaper.tick().await;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => transport.process_event(event).await,
                        None => {
                            info!("driver event channel closed");
                            break;
                        }
                    },
                    _ = reaper.tick() => {
                        if !transport.online() {
                            break;
                        }
                        transport.reap().await;
                    }
                }
            }
        });
        self.inner.tasks.lock().await.push(handle);
    }

    /// Publish the local identity to the radio once the host provides it.
    /// Returns true when the identity is out and advertising/scanning have
    /// been requested; the identity waiter retries until then.
    pub async fn announce_identity(&self) -> bool {
        let Some(identity) = self.inner.router.local_identity() else {
            return false;
        };
        if self.inner.device_name.get().is_some() {
            return true;
        }
        if let Err(e) = self.inner.driver.set_identity(identity).await {
            warn!("failed to install identity on driver: {e}");
            return false;
        }
        let name = self
            .inner
            .config
            .device_name
            .clone()
            .unwrap_or_else(|| protocol::device_name(&identity));
        let name = self.inner.device_name.get_or_init(|| name).clone();

        if self.inner.config.enable_peripheral {
            match self.inner.driver.start_advertising(&name, identity).await {
                Ok(()) => info!(%name, "advertising"),
                Err(e) => error!("failed to start advertising: {e}"),
            }
        }
        if self.inner.config.enable_central {
            match self.inner.driver.start_scanning().await {
                Ok(()) => info!("scanning for mesh peers"),
                Err(e) => error!("failed to start scanning: {e}"),
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Event Dispatch
    // ------------------------------------------------------------------

    /// Process one driver event. The event pump calls this; events for the
    /// same address must be delivered in order.
    pub async fn process_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::DeviceDiscovered(device) => self.handle_discovered(device).await,
            DriverEvent::DeviceConnected { address } => self.handle_connected(address).await,
            DriverEvent::MtuNegotiated { address, mtu } => self.handle_mtu(address, mtu).await,
            DriverEvent::DataReceived { address, data } => self.handle_data(address, data).await,
            DriverEvent::DeviceDisconnected { address } => {
                self.handle_disconnected(address).await
            }
            DriverEvent::Fault { severity, message } => {
                self.handle_fault(severity, message).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery and Selection
    // ------------------------------------------------------------------

    async fn handle_discovered(&self, device: AdvertisedDevice) {
        if !self.online() {
            return;
        }

        // Reject weak signals, except the platform's "could not sample"
        // sentinel which would otherwise mask perfectly usable peers.
        if let Some(rssi) = device.rssi {
            if rssi != RSSI_UNKNOWN && rssi < self.inner.config.min_rssi {
                debug!(address = %device.address, rssi, "below rssi threshold");
                return;
            }
        }

        let matches_service = device
            .service_uuids
            .contains(&self.inner.config.service_uuid);
        let manufacturer_identity = device
            .manufacturer_data
            .get(&protocol::MANUFACTURER_DATA_ID)
            .filter(|blob| blob.len() == NodeIdentity::LEN)
            .and_then(|blob| NodeIdentity::from_bytes(blob).ok());
        let name_identity = device.name.as_deref().and_then(|name| {
            if Some(name) == self.device_name() {
                // Our own advertisement reflected back by the platform.
                None
            } else {
                protocol::identity_from_device_name(name)
            }
        });
        if !matches_service && manufacturer_identity.is_none() && name_identity.is_none() {
            return;
        }
        let advertised_identity = manufacturer_identity.or(name_identity);

        let rssi = device.rssi.unwrap_or(RSSI_UNKNOWN);
        let local_address = self.inner.driver.local_address();
        let now = Instant::now();

        let mut winners = Vec::new();
        {
            let mut peers = self.inner.peers.lock().await;
            if peers.registry.local_address().is_none() {
                if let Some(local) = local_address {
                    peers.registry.set_local_address(local);
                }
            }
            peers
                .registry
                .observe(device.address, device.name.clone(), rssi, now);
            if let Some(identity) = advertised_identity {
                if let Err(mismatch) = peers.registry.bind_identity(device.address, identity) {
                    warn!("{mismatch}");
                }
            }
            peers.registry.prune_stale(STALE_PEER_AGE, now);

            if self.inner.config.enable_central {
                let linked: HashSet<IdentityHash> = peers.links.keys().copied().collect();
                let selected = peers.registry.select_candidates(
                    &linked,
                    self.inner.config.max_connections,
                    now,
                );
                for address in selected {
                    // The attempt is recorded before the driver call so a
                    // re-entrant discovery cannot select this peer again.
                    peers.registry.record_attempt(address, now);
                    if peers.registry.mark_in_flight(address) {
                        winners.push(address);
                    }
                }
            }
        }

        for address in winners {
            debug!(%address, "initiating connection");
            let connected = timeout(
                self.inner.config.connection_timeout,
                self.inner.driver.connect(address),
            )
            .await;
            match connected {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%address, "connect failed: {e}");
                    self.connect_attempt_failed(address).await;
                }
                Err(_) => {
                    warn!(%address, "connect timed out");
                    self.connect_attempt_failed(address).await;
                }
            }
        }
    }

    async fn connect_attempt_failed(&self, address: BleAddress) {
        {
            let mut peers = self.inner.peers.lock().await;
            peers.registry.clear_in_flight(address);
        }
        self.record_failure(address).await;
    }

    /// Record a failure against the peer; on reaching the threshold the
    /// address is blacklisted and the platform's cached device object is
    /// dropped so the next attempt starts from a clean slate.
    async fn record_failure(&self, address: BleAddress) {
        let blacklisted = {
            let mut peers = self.inner.peers.lock().await;
            peers.registry.record_failure(
                address,
                self.inner.config.max_connection_failures,
                self.inner.config.connection_retry_backoff,
                Instant::now(),
            )
        };
        if let Some(duration) = blacklisted {
            warn!(%address, "blacklisted for {duration:?} after repeated failures");
            if let Err(e) = self.inner.driver.remove_device(address).await {
                debug!(%address, "remove_device failed: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection and Handshake
    // ------------------------------------------------------------------

    async fn handle_connected(&self, address: BleAddress) {
        if !self.online() {
            return;
        }
        {
            let mut peers = self.inner.peers.lock().await;
            peers.registry.mark_connected(address);
        }
        match self.inner.driver.peer_role(address) {
            Some(LinkRole::Central) => self.central_handshake(address).await,
            Some(LinkRole::Peripheral) => {
                let known = {
                    let peers = self.inner.peers.lock().await;
                    peers.registry.identity_of(address).copied()
                };
                match known {
                    // Discovery already supplied the identity (manufacturer
                    // blob or name); no handshake is coming.
                    Some(identity) => {
                        self.ensure_peripheral_codec(identity.identity_hash()).await;
                        self.spawn_link(address, identity).await;
                    }
                    None => {
                        // The central writes its identity as its first
                        // packet; the link is created when that arrives.
                        info!(%address, "central connected to our gatt server, awaiting identity");
                    }
                }
            }
            None => {
                warn!(%address, "connected with unknown role, disconnecting");
                if let Err(e) = self.inner.driver.disconnect(address).await {
                    debug!(%address, "disconnect failed: {e}");
                }
            }
        }
    }

    /// Central-role handshake: read the peer's identity characteristic, then
    /// present our own identity with a write to its RX characteristic. The
    /// peer link itself is created when the MTU negotiation completes.
    async fn central_handshake(&self, address: BleAddress) {
        info!(%address, "connected as central, reading peer identity");
        let read = timeout(
            self.inner.config.connection_timeout,
            self.inner
                .driver
                .read_characteristic(address, protocol::IDENTITY_CHARACTERISTIC_UUID),
        )
        .await;
        let identity = match read {
            Ok(Ok(bytes)) => match NodeIdentity::from_bytes(&bytes) {
                Ok(identity) => identity,
                Err(_) => {
                    warn!(%address, "identity characteristic returned {} bytes, disconnecting", bytes.len());
                    self.abort_handshake(address).await;
                    return;
                }
            },
            Ok(Err(e)) => {
                warn!(%address, "identity read failed: {e}");
                self.abort_handshake(address).await;
                return;
            }
            Err(_) => {
                warn!(%address, "identity read timed out");
                self.abort_handshake(address).await;
                return;
            }
        };

        {
            let mut peers = self.inner.peers.lock().await;
            if let Err(mismatch) = peers.registry.bind_identity(address, identity) {
                warn!("{mismatch}");
            }
            peers.registry.record_success(address);
        }
        info!(%address, peer = %identity.identity_hash(), "peer identity received");

        // Write our identity so the peripheral can map this connection to a
        // stable peer; response required, so failure is visible here.
        let Some(local) = self.inner.router.local_identity() else {
            warn!(%address, "local identity not published yet, aborting handshake");
            self.abort_handshake(address).await;
            return;
        };
        if let Err(e) = self
            .inner
            .driver
            .write_characteristic(address, protocol::RX_CHARACTERISTIC_UUID, local.as_bytes())
            .await
        {
            warn!(%address, "identity write failed: {e}");
            self.abort_handshake(address).await;
            return;
        }
        debug!(%address, "identity handshake complete, waiting for mtu");
    }

    async fn abort_handshake(&self, address: BleAddress) {
        {
            let mut peers = self.inner.peers.lock().await;
            peers.registry.clear_in_flight(address);
        }
        self.record_failure(address).await;
        if let Err(e) = self.inner.driver.disconnect(address).await {
            debug!(%address, "disconnect failed: {e}");
        }
    }

    /// MTU negotiation completes the link setup on the central path: the
    /// codec pair is created under the identity hash and the peer link
    /// spawned. On a peripheral-role connection the same event refreshes the
    /// fragmenter created with the fallback MTU.
    async fn handle_mtu(&self, address: BleAddress, mtu: usize) {
        if !self.online() {
            return;
        }
        info!(%address, mtu, "mtu negotiated");
        let identity = {
            let peers = self.inner.peers.lock().await;
            peers.registry.identity_of(address).copied()
        };
        let Some(identity) = identity else {
            debug!(%address, "mtu before identity, codec setup deferred to handshake");
            return;
        };
        let fragmenter = match Fragmenter::new(mtu) {
            Ok(fragmenter) => fragmenter,
            Err(e) => {
                warn!(%address, "unusable mtu: {e}");
                return;
            }
        };

        let key = identity.identity_hash();
        {
            let mut codec = self.inner.codec.lock().await;
            codec.fragmenters.insert(key, fragmenter);
            codec
                .reassemblers
                .entry(key)
                .or_insert_with(|| Reassembler::new(self.inner.config.reassembly_timeout));
        }

        self.spawn_link(address, identity).await;

        // The peer pushes its frames over TX notifications; without the
        // subscription the link is send-only and useless.
        if self.inner.driver.peer_role(address) == Some(LinkRole::Central)
            && self.subscribe_with_retry(address).await.is_err()
        {
            warn!(%address, "notification setup failed, tearing down");
            self.record_failure(address).await;
            if let Err(e) = self.inner.driver.disconnect(address).await {
                debug!(%address, "disconnect failed: {e}");
            }
        }
    }

    async fn subscribe_with_retry(&self, address: BleAddress) -> Result<(), TransportError> {
        let mut last = crate::driver::DriverError::Closed;
        for backoff in NOTIFY_RETRY_BACKOFF {
            match self
                .inner
                .driver
                .subscribe_notifications(address, protocol::TX_CHARACTERISTIC_UUID)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(%address, "notification subscribe failed: {e}, backing off {backoff:?}");
                    last = e;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(TransportError::Driver(last))
    }

    /// Peripheral-role handshake: the first 16-byte write from an address we
    /// hold no identity for carries the central's identity.
    async fn peripheral_handshake(&self, address: BleAddress, payload: &[u8]) {
        let Ok(identity) = NodeIdentity::from_bytes(payload) else {
            return;
        };
        info!(%address, peer = %identity.identity_hash(), "identity handshake from central");
        {
            let mut peers = self.inner.peers.lock().await;
            match peers.registry.bind_identity(address, identity) {
                Ok(_) => {}
                Err(mismatch) => {
                    warn!("{mismatch}");
                    return;
                }
            }
            peers.registry.mark_connected(address);
        }

        self.ensure_peripheral_codec(identity.identity_hash()).await;
        self.spawn_link(address, identity).await;
    }

    /// Create the codec pair for a peripheral-role link. The driver reports
    /// the negotiated MTU separately; the fragmenter starts from the floor
    /// so nothing oversized leaves before then.
    async fn ensure_peripheral_codec(&self, key: IdentityHash) {
        let mut codec = self.inner.codec.lock().await;
        if !codec.fragmenters.contains_key(&key) {
            if let Ok(fragmenter) = Fragmenter::new(FALLBACK_MTU) {
                codec.fragmenters.insert(key, fragmenter);
            }
        }
        codec
            .reassemblers
            .entry(key)
            .or_insert_with(|| Reassembler::new(self.inner.config.reassembly_timeout));
    }

    async fn spawn_link(&self, address: BleAddress, identity: NodeIdentity) {
        let key = identity.identity_hash();
        let mut peers = self.inner.peers.lock().await;
        if peers.links.contains_key(&key) {
            debug!(%address, peer = %key, "link already exists, reusing");
            peers.registry.clear_in_flight(address);
            return;
        }
        let name = peers
            .registry
            .peer(address)
            .and_then(|peer| peer.name.clone())
            .unwrap_or_else(|| format!("BLE-{address}"));
        let link = Arc::new(BlePeerLink::new(address, name.clone(), identity));
        peers.links.insert(key, link);
        peers.registry.clear_in_flight(address);
        info!(%address, %name, peer = %key, "peer link online");
    }

    // ------------------------------------------------------------------
    // Data Path
    // ------------------------------------------------------------------

    async fn handle_data(&self, address: BleAddress, data: Vec<u8>) {
        if !self.online() {
            return;
        }
        let identity = {
            let peers = self.inner.peers.lock().await;
            peers.registry.identity_of(address).copied()
        };
        let identity = match identity {
            Some(identity) => identity,
            None if data.len() == NodeIdentity::LEN => {
                return self.peripheral_handshake(address, &data).await;
            }
            None => {
                warn!(%address, "dropping {} bytes from peer without identity", data.len());
                return;
            }
        };

        let key = identity.identity_hash();
        let completed = {
            let mut codec = self.inner.codec.lock().await;
            let Some(reassembler) = codec.reassemblers.get_mut(&key) else {
                warn!(%address, peer = %key, "no reassembler, dropping frame");
                return;
            };
            match reassembler.accept(&data) {
                Ok(completed) => completed,
                Err(e) => {
                    warn!(%address, "dropping frame: {e}");
                    return;
                }
            }
        };

        if let Some(packet) = completed {
            let link = {
                let peers = self.inner.peers.lock().await;
                peers.links.get(&key).cloned()
            };
            match link {
                Some(link) => {
                    self.inner
                        .rx_bytes
                        .fetch_add(packet.len() as u64, Ordering::Relaxed);
                    link.process_incoming(packet, self.inner.router.as_ref());
                }
                None => warn!(%address, peer = %key, "no link for completed packet"),
            }
        }
    }

    /// Fan an outbound mesh packet out to every online peer link.
    pub async fn outbound(&self, data: &[u8]) {
        if !self.online() {
            return;
        }
        // Snapshot under the peer lock, send without it.
        let links: Vec<Arc<BlePeerLink>> = {
            let peers = self.inner.peers.lock().await;
            peers
                .links
                .values()
                .filter(|link| link.online())
                .cloned()
                .collect()
        };
        debug!("tx {} bytes to {} peer(s)", data.len(), links.len());
        for link in links {
            self.send_to_link(&link, data).await;
        }
    }

    /// Fragment one packet for one link and hand the frames to the driver.
    /// A failed or timed-out frame aborts the rest of this packet; the mesh
    /// layer above retries end to end.
    async fn send_to_link(&self, link: &BlePeerLink, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() > HW_MTU {
            warn!(peer = %link.name(), "dropping {} byte packet above the {HW_MTU} byte mesh mtu", data.len());
            return;
        }
        let frames = {
            let codec = self.inner.codec.lock().await;
            let Some(fragmenter) = codec.fragmenters.get(&link.identity_hash()) else {
                warn!(peer = %link.name(), "no fragmenter, dropping packet");
                return;
            };
            match fragmenter.fragment(data) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(peer = %link.name(), "fragmentation failed: {e}");
                    return;
                }
            }
        };
        if frames.len() > 1 {
            debug!(peer = %link.name(), "fragmenting {} bytes into {} frames", data.len(), frames.len());
        }
        for (index, frame) in frames.iter().enumerate() {
            match timeout(SEND_TIMEOUT, self.inner.driver.send(link.address(), frame)).await {
                Ok(Ok(())) => {
                    link.note_sent(frame.len());
                    self.inner
                        .tx_bytes
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    warn!(
                        peer = %link.name(),
                        "send of frame {}/{} failed: {e}, dropping packet",
                        index + 1,
                        frames.len()
                    );
                    return;
                }
                Err(_) => {
                    warn!(
                        peer = %link.name(),
                        "send of frame {}/{} timed out, dropping packet",
                        index + 1,
                        frames.len()
                    );
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Disconnection
    // ------------------------------------------------------------------

    /// Tear down everything tied to an address: the peer link, both identity
    /// maps, the codec pair, and the platform device object. Safe under
    /// repeated delivery.
    async fn handle_disconnected(&self, address: BleAddress) {
        let removed = {
            let mut peers = self.inner.peers.lock().await;
            let removed = peers.registry.unbind_address(address);
            if let Some((_, key)) = removed {
                if let Some(link) = peers.links.remove(&key) {
                    link.detach();
                    info!(%address, peer = %key, "peer link detached");
                }
            }
            removed
        };
        if let Some((_, key)) = removed {
            let mut codec = self.inner.codec.lock().await;
            codec.fragmenters.remove(&key);
            codec.reassemblers.remove(&key);
        } else {
            debug!(%address, "disconnect for address without peer state");
        }
        if let Err(e) = self.inner.driver.remove_device(address).await {
            debug!(%address, "remove_device failed: {e}");
        }
    }

    async fn handle_fault(&self, severity: Severity, message: String) {
        match severity {
            Severity::Critical => {
                error!("driver critical: {message}, taking transport offline");
                self.mark_offline().await;
            }
            Severity::Error => error!("driver error: {message}"),
            Severity::Warning => warn!("driver warning: {message}"),
            Severity::Debug => debug!("driver: {message}"),
        }
    }

    /// Terminal driver failure: the interface goes offline and the host sees
    /// a normal disconnect per peer.
    async fn mark_offline(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
        let connected = {
            let peers = self.inner.peers.lock().await;
            peers.registry.connected_addresses()
        };
        for address in connected {
            self.handle_disconnected(address).await;
        }
    }

    // ------------------------------------------------------------------
    // Reaper
    // ------------------------------------------------------------------

    /// One reaper cycle: discard timed-out reassembly buffers, reclaim
    /// peripheral connections the platform silently dropped, and prune the
    /// discovery cache.
    pub async fn reap(&self) {
        let swept = {
            let mut codec = self.inner.codec.lock().await;
            let mut swept = 0usize;
            for reassembler in codec.reassemblers.values_mut() {
                swept += reassembler.sweep();
            }
            swept
        };
        if swept > 0 {
            info!("reaper discarded {swept} stale reassembly buffer(s)");
        }

        // Peripheral-side disconnects are not always signalled; treat
        // anything the platform reports dead as a normal disconnect.
        let dead: Vec<BleAddress> = self
            .inner
            .driver
            .peripheral_connections()
            .into_iter()
            .filter(|connection| !connection.connected)
            .map(|connection| connection.address)
            .collect();
        for address in dead {
            debug!(%address, "peripheral connection reported dead, reclaiming");
            self.handle_disconnected(address).await;
        }

        {
            let mut peers = self.inner.peers.lock().await;
            peers.registry.prune_stale(STALE_PEER_AGE, Instant::now());
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Take the transport offline and release everything: advertising and
    /// scanning stop, each peer gets a bounded disconnect, links detach, the
    /// codec tables clear, and the driver is stopped.
    pub async fn detach(&self) {
        if !self.inner.online.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("detaching ble transport");

        if let Err(e) = self.inner.driver.stop_advertising().await {
            debug!("stop_advertising failed: {e}");
        }
        if let Err(e) = self.inner.driver.stop_scanning().await {
            debug!("stop_scanning failed: {e}");
        }

        let connected = {
            let peers = self.inner.peers.lock().await;
            peers.registry.connected_addresses()
        };
        for address in connected {
            match timeout(DISCONNECT_WAIT, self.inner.driver.disconnect(address)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(%address, "disconnect failed: {e}"),
                Err(_) => warn!(%address, "disconnect timed out during shutdown"),
            }
        }

        {
            let mut peers = self.inner.peers.lock().await;
            for link in peers.links.values() {
                link.detach();
            }
            peers.links.clear();
        }
        {
            let mut codec = self.inner.codec.lock().await;
            codec.fragmenters.clear();
            codec.reassemblers.clear();
        }

        if let Err(e) = self.inner.driver.stop().await {
            warn!("driver stop failed: {e}");
        }

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("ble transport detached");
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Descriptors of the currently online peer links.
    pub async fn connected_links(&self) -> Vec<LinkInfo> {
        let peers = self.inner.peers.lock().await;
        peers
            .links
            .values()
            .filter(|link| link.online())
            .map(|link| link.info())
            .collect()
    }

    /// Transport-wide counter snapshot.
    pub async fn stats(&self) -> TransportStats {
        let (connected_peers, discovered_peers, active_links) = {
            let peers = self.inner.peers.lock().await;
            (
                peers.registry.connected_count(),
                peers.registry.discovered_count(),
                peers.links.len(),
            )
        };
        let reassembly = {
            let codec = self.inner.codec.lock().await;
            codec
                .reassemblers
                .values()
                .fold(ReassemblyStats::default(), |acc, reassembler| {
                    acc.merged(reassembler.stats())
                })
        };
        TransportStats {
            online: self.online(),
            connected_peers,
            discovered_peers,
            active_links,
            rx_bytes: self.inner.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.inner.tx_bytes.load(Ordering::Relaxed),
            reassembly,
        }
    }
}
