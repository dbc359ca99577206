//! Known peer addresses.
//!
//! Peers are only ever added; there is no removal and no health tracking.
//! Iteration follows insertion order, which is also the fanout order.

use parking_lot::RwLock;
use tracing::info;

/// Trailing slashes are dropped so `http://b/` and `http://b` are one peer
/// and the endpoint URL never ends up with a double slash.
pub fn normalize_peer_address(address: &str) -> String {
    address.trim().trim_end_matches('/').to_string()
}

#[derive(Default)]
pub struct PeerManager {
    peers: RwLock<Vec<String>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns false if it was already known or is empty.
    pub fn add_peer(&self, address: &str) -> bool {
        let address = normalize_peer_address(address);
        if address.is_empty() {
            return false;
        }

        let mut peers = self.peers.write();
        if peers.contains(&address) {
            return false;
        }
        info!("🤝 Added peer {}", address);
        peers.push(address);
        true
    }

    /// Snapshot in insertion order.
    pub fn peers(&self) -> Vec<String> {
        self.peers.read().clone()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.read().contains(&normalize_peer_address(address))
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
