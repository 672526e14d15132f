//! Peer identity and the address directory.
//!
//! A peer is a remote MQTT-SN endpoint identified by its client id; the
//! directory maps identities to their current datagram address (clients
//! roam, so the binding can move between datagrams).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::ProtocolVersion;

/// Cheaply cloneable handle to a remote endpoint. Equality and hashing are
/// by client id so state tables survive an address change.
#[derive(Debug, Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

#[derive(Debug)]
struct PeerInner {
    client_id: String,
    version: ProtocolVersion,
}

impl Peer {
    pub fn new(client_id: impl Into<String>, version: ProtocolVersion) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                client_id: client_id.into(),
                version,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn version(&self) -> ProtocolVersion {
        self.inner.version
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.client_id == other.inner.client_id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.client_id.hash(state);
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.client_id)
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DirectoryInner {
    by_peer: HashMap<Peer, SocketAddr>,
    by_addr: HashMap<SocketAddr, Peer>,
}

/// Bidirectional peer/address map shared by the transport loop and the
/// state service.
#[derive(Default)]
pub struct PeerDirectory {
    inner: Mutex<DirectoryInner>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind (or re-bind) a peer to its current datagram address.
    pub fn bind(&self, peer: &Peer, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.by_peer.insert(peer.clone(), addr) {
            if old != addr {
                inner.by_addr.remove(&old);
            }
        }
        inner.by_addr.insert(addr, peer.clone());
    }

    pub fn address_of(&self, peer: &Peer) -> Option<SocketAddr> {
        self.inner.lock().by_peer.get(peer).copied()
    }

    pub fn peer_at(&self, addr: SocketAddr) -> Option<Peer> {
        self.inner.lock().by_addr.get(&addr).cloned()
    }

    pub fn remove(&self, peer: &Peer) {
        let mut inner = self.inner.lock();
        if let Some(addr) = inner.by_peer.remove(peer) {
            inner.by_addr.remove(&addr);
        }
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.lock().by_peer.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_peer.is_empty()
    }
}
