//! Per-peer logical link

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rnsble_core::{BleAddress, IdentityHash, NodeIdentity};

use crate::host::{LinkInfo, LinkMode, MeshRouter};

// ----------------------------------------------------------------------------
// Peer Link
// ----------------------------------------------------------------------------

/// The duplex channel for one peer, keyed by identity hash.
///
/// The link owns only what is uniquely its own: the stable peer key, the
/// byte counters, and the online flag. The driver connection handle stays
/// with the driver, and the fragmenter/reassembler pair lives in the
/// controller's codec tables under this link's key; the controller
/// dispatches to links by lookup, so no back-reference is needed.
#[derive(Debug)]
pub struct BlePeerLink {
    address: BleAddress,
    name: String,
    identity: NodeIdentity,
    identity_hash: IdentityHash,
    online: AtomicBool,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

impl BlePeerLink {
    /// Create a link for a peer whose identity handshake has completed.
    pub fn new(address: BleAddress, name: String, identity: NodeIdentity) -> Self {
        Self {
            address,
            name,
            identity,
            identity_hash: identity.identity_hash(),
            online: AtomicBool::new(true),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> BleAddress {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// The stable key this link's codec state is tracked under.
    pub fn identity_hash(&self) -> IdentityHash {
        self.identity_hash
    }

    pub fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Take the link offline; subsequent traffic is dropped.
    pub fn detach(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    /// Bytes received over this link, counted per reassembled packet.
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Bytes transmitted over this link, counted per frame.
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn note_sent(&self, len: usize) {
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Descriptor handed to the host router alongside inbound packets.
    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            identity_hash: self.identity_hash,
            address: self.address,
            name: self.name.clone(),
            mode: LinkMode::Full,
        }
    }

    /// Forward a fully reassembled packet to the host router.
    pub(crate) fn process_incoming(&self, packet: Vec<u8>, router: &dyn MeshRouter) {
        if !self.online() {
            return;
        }
        self.rx_bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
        router.inbound(packet, &self.info());
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingRouter {
        inbound: Mutex<Vec<(Vec<u8>, IdentityHash)>>,
    }

    impl MeshRouter for RecordingRouter {
        fn inbound(&self, data: Vec<u8>, link: &LinkInfo) {
            self.inbound
                .lock()
                .unwrap()
                .push((data, link.identity_hash));
        }

        fn local_identity(&self) -> Option<NodeIdentity> {
            None
        }

        fn drop_stale_routes(&self, _max_age: Duration) {}
    }

    fn link() -> BlePeerLink {
        BlePeerLink::new(
            "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            "RNS-test".into(),
            NodeIdentity::new([9u8; 16]),
        )
    }

    #[test]
    fn incoming_packets_reach_the_router_and_count_bytes() {
        let link = link();
        let router = RecordingRouter {
            inbound: Mutex::new(Vec::new()),
        };

        link.process_incoming(vec![1, 2, 3, 4], &router);
        assert_eq!(link.rx_bytes(), 4);
        let delivered = router.inbound.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, vec![1, 2, 3, 4]);
        assert_eq!(delivered[0].1, link.identity_hash());
    }

    #[test]
    fn detached_links_drop_traffic() {
        let link = link();
        let router = RecordingRouter {
            inbound: Mutex::new(Vec::new()),
        };

        link.detach();
        assert!(!link.online());
        link.process_incoming(vec![1, 2, 3], &router);
        assert_eq!(link.rx_bytes(), 0);
        assert!(router.inbound.lock().unwrap().is_empty());
    }
}
