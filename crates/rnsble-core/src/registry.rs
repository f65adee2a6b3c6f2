//! Peer registry: discovery cache, identity maps, blacklist, in-flight set
//!
//! All of this state lives behind the transport's single peer lock. The
//! registry itself is lock-free plain data so the policy logic stays
//! testable without an async runtime.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::address::BleAddress;
use crate::error::IdentityMismatch;
use crate::identity::{IdentityHash, NodeIdentity};
use crate::peer::DiscoveredPeer;
use crate::policy;

// ----------------------------------------------------------------------------
// Blacklist Entry
// ----------------------------------------------------------------------------

/// A temporarily banned address.
#[derive(Debug, Clone, Copy)]
pub struct BlacklistEntry {
    pub until: Instant,
    pub failures: u32,
}

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

/// Tracks discovered peers, identity mappings, the connection blacklist, and
/// the set of connects currently in flight.
///
/// The two identity tables are kept consistent as a pair: a binding is always
/// inserted and removed together, and no identity hash may map to an address
/// whose reverse mapping points elsewhere.
#[derive(Debug)]
pub struct PeerRegistry {
    discovered: HashMap<BleAddress, DiscoveredPeer>,
    blacklist: HashMap<BleAddress, BlacklistEntry>,
    address_to_identity: HashMap<BleAddress, NodeIdentity>,
    identity_to_address: HashMap<IdentityHash, BleAddress>,
    connected: HashSet<BleAddress>,
    in_flight: HashSet<BleAddress>,
    local_address: Option<BleAddress>,
    max_discovered: usize,
}

impl PeerRegistry {
    /// Create a registry with a bound on the discovery cache.
    pub fn new(max_discovered: usize) -> Self {
        Self {
            discovered: HashMap::new(),
            blacklist: HashMap::new(),
            address_to_identity: HashMap::new(),
            identity_to_address: HashMap::new(),
            connected: HashSet::new(),
            in_flight: HashSet::new(),
            local_address: None,
            max_discovered,
        }
    }

    // ------------------------------------------------------------------
    // Discovery cache
    // ------------------------------------------------------------------

    /// Record an advertisement: create the peer on first sight, refresh RSSI
    /// and last-seen otherwise, then enforce the cache cap.
    pub fn observe(
        &mut self,
        address: BleAddress,
        name: Option<String>,
        rssi: i16,
        now: Instant,
    ) {
        match self.discovered.get_mut(&address) {
            Some(peer) => {
                peer.mark_seen(rssi, now);
                if peer.name.is_none() && name.is_some() {
                    peer.name = name;
                }
            }
            None => {
                self.discovered
                    .insert(address, DiscoveredPeer::new(address, name, rssi, now));
            }
        }
        self.prune_overflow();
    }

    /// Look up a discovered peer.
    pub fn peer(&self, address: BleAddress) -> Option<&DiscoveredPeer> {
        self.discovered.get(&address)
    }

    /// Number of entries in the discovery cache.
    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    /// Drop entries not seen within `max_age`. Connected peers are kept
    /// regardless; their advertisements stop while the link is up.
    pub fn prune_stale(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.discovered.len();
        let connected = &self.connected;
        self.discovered.retain(|address, peer| {
            connected.contains(address) || now.saturating_duration_since(peer.last_seen) <= max_age
        });
        before - self.discovered.len()
    }

    fn prune_overflow(&mut self) {
        if self.discovered.len() <= self.max_discovered {
            return;
        }
        let batch = (self.max_discovered / 5).max(1);
        let mut evictable: Vec<(Instant, BleAddress)> = self
            .discovered
            .iter()
            .filter(|(address, _)| !self.connected.contains(*address))
            .map(|(address, peer)| (peer.last_seen, *address))
            .collect();
        evictable.sort_by_key(|(last_seen, _)| *last_seen);
        for (_, address) in evictable.into_iter().take(batch) {
            self.discovered.remove(&address);
            debug!(%address, "evicted from discovery cache");
        }
    }

    // ------------------------------------------------------------------
    // Local adapter
    // ------------------------------------------------------------------

    /// Set the local adapter address once the driver reports it.
    pub fn set_local_address(&mut self, address: BleAddress) {
        self.local_address = Some(address);
    }

    /// The local adapter address, if known.
    pub fn local_address(&self) -> Option<BleAddress> {
        self.local_address
    }

    // ------------------------------------------------------------------
    // Connection state
    // ------------------------------------------------------------------

    /// Mark an address as connected at the driver level.
    pub fn mark_connected(&mut self, address: BleAddress) {
        self.connected.insert(address);
    }

    /// Whether the address currently has a driver-level connection.
    pub fn is_connected(&self, address: BleAddress) -> bool {
        self.connected.contains(&address)
    }

    /// Number of driver-level connections.
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Snapshot of connected addresses.
    pub fn connected_addresses(&self) -> Vec<BleAddress> {
        self.connected.iter().copied().collect()
    }

    /// Mark a connect as in flight. Returns false if one already was.
    pub fn mark_in_flight(&mut self, address: BleAddress) -> bool {
        self.in_flight.insert(address)
    }

    /// Clear the in-flight mark.
    pub fn clear_in_flight(&mut self, address: BleAddress) {
        self.in_flight.remove(&address);
    }

    /// Whether a connect to this address is in flight.
    pub fn is_in_flight(&self, address: BleAddress) -> bool {
        self.in_flight.contains(&address)
    }

    // ------------------------------------------------------------------
    // Identity maps
    // ------------------------------------------------------------------

    /// Bind an address to a peer identity, keeping both tables consistent.
    ///
    /// Re-binding the same identity is idempotent. A different identity for
    /// an already-bound address is rejected; identity is immutable for the
    /// lifetime of a link. If the identity was previously bound to another
    /// address (MAC rotation), the stale pairing is retired first.
    pub fn bind_identity(
        &mut self,
        address: BleAddress,
        identity: NodeIdentity,
    ) -> Result<IdentityHash, IdentityMismatch> {
        let hash = identity.identity_hash();
        if let Some(existing) = self.address_to_identity.get(&address) {
            if *existing == identity {
                return Ok(hash);
            }
            return Err(IdentityMismatch {
                address,
                existing: existing.identity_hash(),
                offered: hash,
            });
        }
        if let Some(stale) = self.identity_to_address.insert(hash, address) {
            if stale != address {
                self.address_to_identity.remove(&stale);
                debug!(%address, previous = %stale, "identity moved to a new address");
            }
        }
        self.address_to_identity.insert(address, identity);
        Ok(hash)
    }

    /// Identity bound to an address, if the handshake has completed.
    pub fn identity_of(&self, address: BleAddress) -> Option<&NodeIdentity> {
        self.address_to_identity.get(&address)
    }

    /// Reverse lookup from peer key to current address.
    pub fn address_of(&self, hash: IdentityHash) -> Option<BleAddress> {
        self.identity_to_address.get(&hash).copied()
    }

    /// Remove all per-address state on disconnect: the identity pair, the
    /// connected mark, and the in-flight mark. Safe to call repeatedly.
    pub fn unbind_address(&mut self, address: BleAddress) -> Option<(NodeIdentity, IdentityHash)> {
        self.connected.remove(&address);
        self.in_flight.remove(&address);
        let identity = self.address_to_identity.remove(&address)?;
        let hash = identity.identity_hash();
        if self.identity_to_address.get(&hash) == Some(&address) {
            self.identity_to_address.remove(&hash);
        }
        Some((identity, hash))
    }

    // ------------------------------------------------------------------
    // Attempt history and blacklist
    // ------------------------------------------------------------------

    /// Record a connection attempt against the peer's history.
    pub fn record_attempt(&mut self, address: BleAddress, now: Instant) {
        if let Some(peer) = self.discovered.get_mut(&address) {
            peer.record_attempt(now);
        }
    }

    /// Record a successful connection; clears any blacklist entry but keeps
    /// the failure counter as a long-term reliability signal.
    pub fn record_success(&mut self, address: BleAddress) {
        if let Some(peer) = self.discovered.get_mut(&address) {
            peer.record_success();
        }
        if self.blacklist.remove(&address).is_some() {
            debug!(%address, "cleared blacklist after successful connection");
        }
    }

    /// Record a failed connection. Once the failure count reaches the
    /// threshold the address is blacklisted with capped exponential back-off;
    /// the new blacklist duration is returned when that happens.
    pub fn record_failure(
        &mut self,
        address: BleAddress,
        max_failures: u32,
        backoff: Duration,
        now: Instant,
    ) -> Option<Duration> {
        let peer = self.discovered.get_mut(&address)?;
        peer.record_failure();
        if max_failures > 0 && peer.failures >= max_failures {
            let duration = policy::blacklist_duration(peer.failures, max_failures, backoff);
            self.blacklist.insert(
                address,
                BlacklistEntry {
                    until: now + duration,
                    failures: peer.failures,
                },
            );
            return Some(duration);
        }
        None
    }

    /// Whether the address is currently blacklisted; expired entries are
    /// removed on the way.
    pub fn is_blacklisted(&mut self, address: BleAddress, now: Instant) -> bool {
        match self.blacklist.get(&address) {
            Some(entry) if entry.until > now => true,
            Some(_) => {
                self.blacklist.remove(&address);
                debug!(%address, "blacklist expired");
                false
            }
            None => false,
        }
    }

    /// Current blacklist entry, if any.
    pub fn blacklist_entry(&self, address: BleAddress) -> Option<&BlacklistEntry> {
        self.blacklist.get(&address)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Pick the peers to connect to next.
    ///
    /// From the discovered set, removes peers that already have a link for
    /// their identity, addresses with a connect in flight or a live driver
    /// connection, blacklisted addresses, peers the local side must defer to
    /// under MAC arbitration, and peers inside the attempt cooldown. The
    /// remainder is scored and the top `max_peers - connected` returned,
    /// best first.
    pub fn select_candidates(
        &self,
        linked: &HashSet<IdentityHash>,
        max_peers: usize,
        now: Instant,
    ) -> Vec<BleAddress> {
        let available = max_peers.saturating_sub(self.connected.len());
        if available == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(f64, BleAddress)> = Vec::new();
        for (address, peer) in &self.discovered {
            if self.connected.contains(address) || self.in_flight.contains(address) {
                continue;
            }
            if let Some(identity) = self.address_to_identity.get(address) {
                if linked.contains(&identity.identity_hash()) {
                    continue;
                }
            }
            if let Some(entry) = self.blacklist.get(address) {
                if entry.until > now {
                    continue;
                }
            }
            if let Some(local) = self.local_address {
                if policy::defers_to(&local, address) {
                    debug!(peer = %address, "deferring, peer has the lower address");
                    continue;
                }
            }
            if let Some(last_attempt) = peer.last_attempt_at {
                if now.saturating_duration_since(last_attempt) < policy::ATTEMPT_COOLDOWN {
                    continue;
                }
            }
            scored.push((policy::score_peer(peer, now), *address));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.truncate(available);
        scored.into_iter().map(|(_, address)| address).collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
