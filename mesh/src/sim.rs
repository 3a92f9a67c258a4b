//! An in-memory `NetworkAgent`/`SecureNetworkAgent`/`PeerSource` trio for exercising the peer
//! group agent without a real transport, mirroring how the store's `MemoryBackend` stands in
//! for a real backend in tests.
use crate::error::Result;
use crate::transport::{ConnectionInfo, Endpoint, NetworkAgent, PeerInfo, PeerSource, SecureNetworkAgent, TransportStatus};
use async_trait::async_trait;
use meshgraph_core::{Hash, Identity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single simulated byte-duplex link between two `SimNetwork` endpoints.
struct SimLink {
    local_endpoint: Endpoint,
    remote_endpoint: Option<Endpoint>,
    status: TransportStatus,
}

/// A shared switchboard every `SimNetwork` instance in a test registers against, so that
/// `connect` on one can find the matching `listen` on another.
#[derive(Default)]
pub struct SimSwitchboard {
    listeners: Mutex<HashMap<Endpoint, Hash>>,
}

impl SimSwitchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// A simulated `NetworkAgent` backed by a shared `SimSwitchboard`.
pub struct SimNetwork {
    switchboard: Arc<SimSwitchboard>,
    next_conn: AtomicU64,
    connections: Mutex<HashMap<u64, SimLink>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::with_switchboard(SimSwitchboard::new())
    }

    pub fn with_switchboard(switchboard: Arc<SimSwitchboard>) -> Self {
        Self {
            switchboard,
            next_conn: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAgent for SimNetwork {
    async fn listen(&self, endpoint: &Endpoint, identity_hash: Hash) -> Result<()> {
        self.switchboard.listeners.lock().insert(endpoint.clone(), identity_hash);
        Ok(())
    }

    async fn connect(&self, local: &Endpoint, remote: &Endpoint, _requester_id: &str) -> Result<u64> {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(
            conn,
            SimLink {
                local_endpoint: local.clone(),
                remote_endpoint: Some(remote.clone()),
                status: TransportStatus::Up,
            },
        );
        Ok(conn)
    }

    async fn accept_connection(&self, _conn: u64, _requester_id: &str) -> Result<()> {
        Ok(())
    }

    async fn release_connection(&self, conn: u64, _requester_id: &str) -> Result<()> {
        self.connections.lock().remove(&conn);
        Ok(())
    }

    async fn check_connection(&self, conn: u64) -> Result<bool> {
        Ok(self
            .connections
            .lock()
            .get(&conn)
            .map(|link| link.status == TransportStatus::Up)
            .unwrap_or(false))
    }

    async fn send_message(&self, _conn: u64, _requester_id: &str, _message: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn connection_info(&self, conn: u64) -> Option<ConnectionInfo> {
        self.connections.lock().get(&conn).map(|link| ConnectionInfo {
            remote_endpoint: link.remote_endpoint.clone(),
            remote_instance_id: None,
            status: link.status,
        })
    }

    async fn query_for_listening_addresses(&self, _self_endpoint: &Endpoint, candidates: &[Endpoint]) -> Result<()> {
        let known = self.switchboard.listeners.lock();
        for candidate in candidates {
            if !known.contains_key(candidate) {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// A simulated `SecureNetworkAgent` that authenticates every connection it's told to, with no
/// actual cryptography.
#[derive(Default)]
pub struct SimSecureNetwork;

impl SimSecureNetwork {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecureNetworkAgent for SimSecureNetwork {
    async fn secure_for_receiving(&self, _conn: u64, _local_identity: Arc<Identity>) -> Result<()> {
        Ok(())
    }

    async fn secure_for_sending(&self, _conn: u64, _remote_identity_hash: Hash, _remote_identity: Option<Arc<Identity>>) -> Result<()> {
        Ok(())
    }

    async fn send_securely(&self, _conn: u64, _local_identity_hash: Hash, _remote_identity_hash: Hash, _requester_id: &str, _payload: Vec<u8>) -> Result<()> {
        Ok(())
    }
}

/// A simulated `PeerSource` backed by a fixed, mutable roster.
#[derive(Default)]
pub struct SimPeerSource {
    peers: Mutex<Vec<PeerInfo>>,
}

impl SimPeerSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: Vec<PeerInfo>) -> Self {
        Self {
            peers: Mutex::new(peers),
        }
    }

    pub fn add_peer(&self, peer: PeerInfo) {
        self.peers.lock().push(peer);
    }

    pub fn remove_peer(&self, endpoint: &Endpoint) {
        self.peers.lock().retain(|p| &p.endpoint != endpoint);
    }
}

#[async_trait]
impl PeerSource for SimPeerSource {
    async fn get_peers(&self, count: usize) -> Vec<PeerInfo> {
        self.peers.lock().iter().take(count).cloned().collect()
    }

    async fn get_peer_for_endpoint(&self, endpoint: &Endpoint) -> Option<PeerInfo> {
        self.peers.lock().iter().find(|p| &p.endpoint == endpoint).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn sim_peer_source_roster_can_be_mutated_between_ticks() {
        use meshgraph_core::{hash_value, Value};

        let source = SimPeerSource::new();
        let hash = hash_value(&Value::Str("b".into())).unwrap();
        source.add_peer(PeerInfo::new("b", hash));
        assert_eq!(source.get_peers(10).await.len(), 1);
        source.remove_peer(&"b".to_string());
        assert!(source.get_peers(10).await.is_empty());
    }
}
