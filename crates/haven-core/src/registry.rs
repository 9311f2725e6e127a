//! Shared registries and the virtual address pool.
//!
//! `Registries` is the only shared mutable state in the engine besides the
//! per-component tables (policies live in the shaper, metrics in the
//! monitor). Each table has its own dedicated lock, held only across the
//! read-modify-write - never across I/O. The object is owned by the
//! connection manager and injected into components; there is no ambient
//! global state.

use crate::error::CoreError;
use crate::peer::{ConnectionState, ConnectionStatus, PeerId};
use haven_discovery::PeerRecord;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError, RwLock};

/// Virtual address pool over a /24.
///
/// The host always owns `.1`; it is never handed out and never reassigned.
/// `.0` (network) and `.255` (broadcast) are not allocatable.
#[derive(Debug)]
pub struct IpPool {
    base: [u8; 3],
    allocated: BTreeSet<u8>,
}

impl IpPool {
    /// Pool over `base.0/24`, e.g. `10.0.0.0`
    #[must_use]
    pub fn new(network: Ipv4Addr) -> Self {
        let octets = network.octets();
        Self {
            base: [octets[0], octets[1], octets[2]],
            allocated: BTreeSet::new(),
        }
    }

    /// The address reserved for the host itself
    #[must_use]
    pub fn host_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.base[0], self.base[1], self.base[2], 1)
    }

    /// Hand out the lowest free address in `.2..=.254`.
    ///
    /// # Errors
    ///
    /// [`CoreError::PoolExhausted`] when every address is taken.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, CoreError> {
        for host in 2..=254u8 {
            if !self.allocated.contains(&host) {
                self.allocated.insert(host);
                return Ok(Ipv4Addr::new(self.base[0], self.base[1], self.base[2], host));
            }
        }
        Err(CoreError::PoolExhausted)
    }

    /// Return an address to the pool. Releasing the host address or an
    /// address outside the pool is ignored.
    pub fn release(&mut self, ip: Ipv4Addr) {
        let octets = ip.octets();
        if octets[..3] == self.base && octets[3] >= 2 && octets[3] <= 254 {
            self.allocated.remove(&octets[3]);
        }
    }

    /// Number of currently allocated addresses
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

/// The engine's shared tables: discovered peers, live connections, and the
/// virtual address pool
pub struct Registries {
    peers: RwLock<HashMap<String, PeerRecord>>,
    connections: RwLock<HashMap<PeerId, ConnectionState>>,
    ip_pool: Mutex<IpPool>,
}

impl Registries {
    /// Fresh registries over the given virtual network
    #[must_use]
    pub fn new(network: Ipv4Addr) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            ip_pool: Mutex::new(IpPool::new(network)),
        }
    }

    /// The host's own virtual address
    #[must_use]
    pub fn host_ip(&self) -> Ipv4Addr {
        self.ip_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .host_ip()
    }

    /// Allocate a virtual address for a peer.
    ///
    /// # Errors
    ///
    /// [`CoreError::PoolExhausted`] when the pool is empty.
    pub fn allocate_ip(&self) -> Result<Ipv4Addr, CoreError> {
        self.ip_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate()
    }

    /// Return a peer's virtual address to the pool
    pub fn release_ip(&self, ip: Ipv4Addr) {
        self.ip_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(ip);
    }

    /// Record or refresh a discovered peer
    pub fn upsert_peer(&self, record: PeerRecord) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.name.clone(), record);
    }

    /// Drop a discovered peer by name
    pub fn remove_peer(&self, name: &str) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Snapshot of the discovered peers
    #[must_use]
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Insert a fresh connection entry.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyConnected`] when a non-closed entry for the peer
    /// exists - at most one live connection per peer.
    pub fn insert_connection(&self, state: ConnectionState) -> Result<(), CoreError> {
        let mut table = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = table.get(&state.peer_id) {
            if !existing.status.is_closed() {
                return Err(CoreError::AlreadyConnected(state.peer_id.clone()));
            }
        }
        table.insert(state.peer_id.clone(), state);
        Ok(())
    }

    /// Clone a connection entry
    #[must_use]
    pub fn connection(&self, peer: &str) -> Option<ConnectionState> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    /// Apply a closure to a connection entry under the table lock
    pub fn with_connection<T>(
        &self,
        peer: &str,
        f: impl FnOnce(&mut ConnectionState) -> T,
    ) -> Option<T> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(peer)
            .map(f)
    }

    /// Follow a state-machine edge for a peer's connection.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownPeer`] when no entry exists,
    /// [`CoreError::InvalidTransition`] when the edge does not.
    pub fn transition(&self, peer: &str, next: ConnectionStatus) -> Result<(), CoreError> {
        self.with_connection(peer, |state| state.transition(next))
            .ok_or_else(|| CoreError::UnknownPeer(peer.to_string()))?
    }

    /// Remove a connection entry entirely
    pub fn remove_connection(&self, peer: &str) -> Option<ConnectionState> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
    }

    /// Peers currently in the given status
    #[must_use]
    pub fn peers_in_status(&self, status: ConnectionStatus) -> Vec<PeerId> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|state| state.status == status)
            .map(|state| state.peer_id.clone())
            .collect()
    }

    /// Number of live (non-closed) connections
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|state| !state.status.is_closed())
            .count()
    }
}
