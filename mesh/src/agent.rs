//! The peer group agent: a cooperative tick loop that discovers, connects to, authenticates,
//! and deduplicates peers for a named group, within configured bounds, and exposes a
//! message-passing surface to higher layers.
use crate::config::Config;
use crate::connection::{ConnectionState, PeerConnection};
use crate::error::{Error, Result};
use crate::transport::{
    agent_id_for_group, ConnId, Endpoint, InstanceId, NetworkAgent, PeerInfo, PeerSource,
    SecureNetworkAgent, SecuredMessage, TransportStatus, UnsecuredMessage,
};
use meshgraph_core::Hash;
use meshgraph_stream::AsyncStreamSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Events the agent publishes as peers join and leave the mesh.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    /// A peer reached `Ready` for the first time.
    NewPeer {
        /// The group the peer joined.
        peer_group_id: String,
        /// The peer that joined.
        peer: PeerInfo,
    },
    /// A previously `Ready` peer has no remaining live connection.
    LostPeer {
        /// The group the peer left.
        peer_group_id: String,
        /// The peer that left.
        peer: PeerInfo,
    },
}

/// Cumulative counters for observability.
#[derive(Default, Debug)]
pub struct MeshStats {
    pub connection_inits: AtomicU64,
    pub connection_accepts: AtomicU64,
    pub connection_timeouts: AtomicU64,
    pub dedup_resolutions: AtomicU64,
}

/// A point-in-time snapshot of `MeshStats`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshStatsSnapshot {
    pub connection_inits: u64,
    pub connection_accepts: u64,
    pub connection_timeouts: u64,
    pub dedup_resolutions: u64,
}

impl MeshStats {
    fn snapshot(&self) -> MeshStatsSnapshot {
        MeshStatsSnapshot {
            connection_inits: self.connection_inits.load(Ordering::Relaxed),
            connection_accepts: self.connection_accepts.load(Ordering::Relaxed),
            connection_timeouts: self.connection_timeouts.load(Ordering::Relaxed),
            dedup_resolutions: self.dedup_resolutions.load(Ordering::Relaxed),
        }
    }
}

/// Coarse run state reported by `getState()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AgentState {
    Running,
    ShuttingDown,
    Stopped,
}

struct OnlineQueryCache {
    capacity: usize,
    order: Vec<Endpoint>,
    timestamps: HashMap<Endpoint, Instant>,
}

impl OnlineQueryCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::new(),
            timestamps: HashMap::new(),
        }
    }

    fn recall(&self, endpoint: &Endpoint) -> Option<Instant> {
        self.timestamps.get(endpoint).copied()
    }

    fn record(&mut self, endpoint: Endpoint) {
        if self.timestamps.insert(endpoint.clone(), Instant::now()).is_none() {
            self.order.push(endpoint);
            if self.order.len() > self.capacity {
                let evicted = self.order.remove(0);
                self.timestamps.remove(&evicted);
            }
        }
    }
}

#[derive(Default)]
struct MeshState {
    connections: HashMap<ConnId, PeerConnection>,
    connections_per_endpoint: HashMap<Endpoint, Vec<ConnId>>,
    instance_id_per_endpoint: HashMap<Endpoint, InstanceId>,
    connection_attempt_timestamps: HashMap<Endpoint, Instant>,
    chosen_for_deduplication: HashMap<Endpoint, ConnId>,
    ready_peers: HashMap<Endpoint, PeerInfo>,
}

/// Maintains an authenticated connection mesh for one named peer group.
pub struct PeerGroupAgent<N, S, P> {
    peer_group_id: String,
    local: PeerInfo,
    config: Config,
    network: Arc<N>,
    secure: Arc<S>,
    peer_source: Arc<P>,
    state: Mutex<MeshState>,
    online_query_cache: Mutex<OnlineQueryCache>,
    stats: MeshStats,
    tick_lock: Mutex<()>,
    started_at: Instant,
    run_state: Mutex<AgentState>,
    shutting_down: AtomicBool,
    events: Arc<AsyncStreamSource<MeshEvent>>,
}

impl<N, S, P> PeerGroupAgent<N, S, P>
where
    N: NetworkAgent,
    S: SecureNetworkAgent,
    P: PeerSource,
{
    /// Builds a new agent for `peer_group_id`, not yet listening.
    pub fn new(peer_group_id: impl Into<String>, local: PeerInfo, config: Config, network: Arc<N>, secure: Arc<S>, peer_source: Arc<P>) -> Arc<Self> {
        let online_query_cache = Mutex::new(OnlineQueryCache::new(config.online_query_cache_size));
        Arc::new(Self {
            peer_group_id: peer_group_id.into(),
            local,
            config,
            network,
            secure,
            peer_source,
            state: Mutex::new(MeshState::default()),
            online_query_cache,
            stats: MeshStats::default(),
            tick_lock: Mutex::new(()),
            started_at: Instant::now(),
            run_state: Mutex::new(AgentState::Running),
            shutting_down: AtomicBool::new(false),
            events: Arc::new(AsyncStreamSource::new(256)),
        })
    }

    /// The `agentId` this group's control traffic is routed under.
    pub fn agent_id(&self) -> String {
        agent_id_for_group(&self.peer_group_id)
    }

    /// A fresh, independently-buffered view of this agent's `MeshEvent`s.
    pub fn events(&self) -> Arc<AsyncStreamSource<MeshEvent>> {
        self.events.clone()
    }

    /// Starts listening on the local endpoint.
    pub async fn start(&self) -> Result<()> {
        self.network.listen(&self.local.endpoint, self.local.identity_hash).await?;
        Ok(())
    }

    /// Runs one tick cycle: clean-up, discovery, deduplication, peer validation. Single-flighted
    /// via a try-lock; a tick that finds the lock held is a no-op.
    pub async fn tick(&self) -> Result<()> {
        let _guard = match self.tick_lock.try_lock() {
            Some(guard) => guard,
            None => {
                trace!(peer_group_id = %self.peer_group_id, "tick skipped, lock held");
                return Ok(());
            }
        };
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(());
        }
        self.cleanup().await;
        self.discover().await?;
        self.deduplicate().await?;
        self.validate_peers().await;
        Ok(())
    }

    async fn cleanup(&self) {
        let timeout = self.config.peer_connection_timeout;
        let dead: Vec<ConnId> = {
            let state = self.state.lock();
            state
                .connections
                .values()
                .filter(|c| c.is_timed_out(timeout) || !matches!(c.state, ConnectionState::Ready))
                .filter_map(|c| {
                    let alive = c.state == ConnectionState::Ready;
                    if alive {
                        None
                    } else if c.is_timed_out(timeout) {
                        Some(c.conn)
                    } else {
                        None
                    }
                })
                .collect()
        };
        for conn in dead {
            self.stats.connection_timeouts.fetch_add(1, Ordering::Relaxed);
            self.teardown(conn, Error::ConnectionTimeout(conn)).await;
        }

        let closed: Vec<ConnId> = {
            let state = self.state.lock();
            state.connections.keys().copied().collect()
        };
        for conn in closed {
            if !self.network.check_connection(conn).await.unwrap_or(false) {
                let still_tracked = self.state.lock().connections.contains_key(&conn);
                if still_tracked {
                    self.teardown(conn, Error::TransportClosed(conn)).await;
                }
            }
        }

        let stale_before = Instant::now() - self.config.peer_connection_attempt_interval;
        self.state.lock().connection_attempt_timestamps.retain(|_, ts| *ts > stale_before);
    }

    async fn discover(&self) {
        let (connected_count, below_min) = {
            let state = self.state.lock();
            let count = state.connections_per_endpoint.len();
            (count, count < self.config.min_peers)
        };
        if !below_min {
            return;
        }
        let since_start = self.started_at.elapsed();
        let interval = self.config.effective_discovery_interval(since_start, below_min);
        let candidates = self.peer_source.get_peers(self.config.min_peers * 5).await;
        let mut picked = Vec::new();
        {
            let state = self.state.lock();
            let cache = self.online_query_cache.lock();
            for candidate in candidates {
                if candidate.endpoint == self.local.endpoint {
                    continue;
                }
                if state.connections_per_endpoint.contains_key(&candidate.endpoint) {
                    continue;
                }
                if let Some(last) = cache.recall(&candidate.endpoint) {
                    if last.elapsed() < interval {
                        continue;
                    }
                }
                if let Some(attempted) = state.connection_attempt_timestamps.get(&candidate.endpoint) {
                    if attempted.elapsed() < self.config.effective_connection_attempt_interval(since_start, below_min) {
                        continue;
                    }
                }
                picked.push(candidate);
                if picked.len() >= self.config.min_peers - connected_count {
                    break;
                }
            }
        }
        if picked.is_empty() {
            return;
        }
        let endpoints: Vec<Endpoint> = picked.iter().map(|p| p.endpoint.clone()).collect();
        if self
            .network
            .query_for_listening_addresses(&self.local.endpoint, &endpoints)
            .await
            .is_ok()
        {
            let mut cache = self.online_query_cache.lock();
            for endpoint in endpoints {
                cache.record(endpoint);
            }
        }
    }

    /// Called when the transport confirms a candidate endpoint is listening; attempts a
    /// connection if we still want one.
    pub async fn on_remote_listening(&self, endpoint: Endpoint) -> Result<()> {
        let peer = match self.peer_source.get_peer_for_endpoint(&endpoint).await {
            Some(p) => p,
            None => return Ok(()),
        };
        if !self.should_connect_to_peer(&peer) {
            return Ok(());
        }
        self.state.lock().connection_attempt_timestamps.insert(endpoint.clone(), Instant::now());
        let requester_id = self.agent_id();
        let conn = self.network.connect(&self.local.endpoint, &endpoint, &requester_id).await?;
        let mut pc = PeerConnection::new(conn, true);
        pc.remote_endpoint = Some(endpoint.clone());
        pc.remote_identity_hash = Some(peer.identity_hash);
        {
            let mut state = self.state.lock();
            state.connections_per_endpoint.entry(endpoint).or_default().push(conn);
            state.connections.insert(conn, pc);
        }
        self.stats.connection_inits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `shouldConnectToPeer(p)`.
    fn should_connect_to_peer(&self, peer: &PeerInfo) -> bool {
        if peer.identity_hash == self.local.identity_hash {
            return false;
        }
        let state = self.state.lock();
        if state.connections_per_endpoint.len() >= self.config.min_peers {
            return false;
        }
        if state.connections_per_endpoint.contains_key(&peer.endpoint) {
            return false;
        }
        match state.connection_attempt_timestamps.get(&peer.endpoint) {
            Some(ts) => ts.elapsed() >= self.config.peer_connection_attempt_interval,
            None => true,
        }
    }

    /// `shouldAcceptPeerConnection(p)`. `conn` is the candidate connection whose reported
    /// instance id must match any instance already pinned for this endpoint; a `None` on
    /// either side matches anything rather than mismatching, since not every transport
    /// reports an instance id.
    fn should_accept_peer_connection(&self, peer: &PeerInfo, conn: ConnId) -> bool {
        if peer.identity_hash == self.local.identity_hash {
            return false;
        }
        let state = self.state.lock();
        let current = state.connections_per_endpoint.get(&peer.endpoint).map(Vec::len).unwrap_or(0);
        if current + 1 > self.config.max_peers {
            return false;
        }
        let has_working = state
            .connections_per_endpoint
            .get(&peer.endpoint)
            .map(|conns| conns.iter().any(|c| state.connections.get(c).map(|pc| pc.is_ready()).unwrap_or(false)))
            .unwrap_or(false);
        if has_working {
            return false;
        }
        match (state.instance_id_per_endpoint.get(&peer.endpoint), state.connections.get(&conn).and_then(|pc| pc.remote_instance_id)) {
            (Some(pinned), Some(reported)) => *pinned == reported,
            _ => true,
        }
    }

    /// An inbound connection arrived on the transport.
    pub async fn on_connection_received(&self, conn: ConnId, endpoint: Endpoint) {
        let pc = PeerConnection::new(conn, false);
        let mut state = self.state.lock();
        state.connections_per_endpoint.entry(endpoint).or_default().push(conn);
        state.connections.insert(conn, pc);
    }

    /// A connection's transport status changed.
    pub async fn on_connection_status_change(&self, conn: ConnId, status: TransportStatus) -> Result<()> {
        match status {
            TransportStatus::Up => self.handle_transport_ready(conn).await,
            TransportStatus::Down => {
                self.teardown(conn, Error::TransportClosed(conn)).await;
                Ok(())
            }
        }
    }

    async fn handle_transport_ready(&self, conn: ConnId) -> Result<()> {
        let outbound = {
            let state = self.state.lock();
            state.connections.get(&conn).map(|c| c.outbound)
        };
        let outbound = match outbound {
            Some(v) => v,
            None => return Err(Error::UnknownConnection(conn)),
        };
        let requester_id = self.agent_id();
        if outbound {
            let msg = UnsecuredMessage::PeeringOffer {
                peer_group_id: self.peer_group_id.clone(),
                local_identity_hash: self.local.identity_hash,
            };
            self.network.send_message(conn, &requester_id, encode_unsecured(&msg)).await?;
            self.transition(conn, ConnectionState::OfferSent);
        } else {
            self.transition(conn, ConnectionState::WaitingForOffer);
        }
        Ok(())
    }

    fn transition(&self, conn: ConnId, to: ConnectionState) {
        if let Some(pc) = self.state.lock().connections.get_mut(&conn) {
            pc.transition(to);
        }
    }

    /// An unsecured message arrived before the channel was secured.
    pub async fn on_unsecured_message(&self, conn: ConnId, message: UnsecuredMessage) -> Result<()> {
        match message {
            UnsecuredMessage::PeeringOffer { peer_group_id, local_identity_hash } => {
                self.handle_offer(conn, peer_group_id, local_identity_hash).await
            }
            UnsecuredMessage::PeeringOfferReply { peer_group_id, local_identity_hash, accepted } => {
                self.handle_offer_reply(conn, peer_group_id, local_identity_hash, accepted).await
            }
        }
    }

    async fn handle_offer(&self, conn: ConnId, peer_group_id: String, remote_identity_hash: Hash) -> Result<()> {
        if peer_group_id != self.peer_group_id {
            self.reject_offer(conn, peer_group_id).await;
            return Err(Error::PeerGroupMismatch {
                expected: self.peer_group_id.clone(),
                actual: peer_group_id,
            });
        }
        let state_ok = {
            let state = self.state.lock();
            match state.connections.get(&conn) {
                Some(pc) => matches!(pc.state, ConnectionState::WaitingForOffer | ConnectionState::OfferSent),
                None => false,
            }
        };
        let peer = self.peer_source.get_peer_for_endpoint(&self.endpoint_of(conn)).await;
        let accept = state_ok
            && peer.as_ref().map(|p| p.identity_hash == remote_identity_hash).unwrap_or(false)
            && peer.as_ref().map(|p| self.should_accept_peer_connection(p, conn)).unwrap_or(false);

        if let Some(pc) = self.state.lock().connections.get_mut(&conn) {
            pc.remote_identity_hash = Some(remote_identity_hash);
        }
        let requester_id = self.agent_id();
        let reply = UnsecuredMessage::PeeringOfferReply {
            peer_group_id: self.peer_group_id.clone(),
            local_identity_hash: self.local.identity_hash,
            accepted: accept,
        };
        self.network.send_message(conn, &requester_id, encode_unsecured(&reply)).await?;
        if accept {
            self.transition(conn, ConnectionState::OfferAccepted);
            self.stats.connection_accepts.fetch_add(1, Ordering::Relaxed);
            let local_identity = self.local.identity.clone().ok_or(Error::MissingLocalIdentity(conn))?;
            self.secure.secure_for_receiving(conn, local_identity).await?;
        } else {
            self.teardown(conn, Error::NotOwner { conn, requester: requester_id }).await;
        }
        Ok(())
    }

    async fn handle_offer_reply(&self, conn: ConnId, peer_group_id: String, remote_identity_hash: Hash, accepted: bool) -> Result<()> {
        if peer_group_id != self.peer_group_id {
            return Err(Error::PeerGroupMismatch {
                expected: self.peer_group_id.clone(),
                actual: peer_group_id,
            });
        }
        if !accepted {
            self.teardown(conn, Error::TransportClosed(conn)).await;
            return Ok(());
        }
        if let Some(pc) = self.state.lock().connections.get_mut(&conn) {
            pc.remote_identity_hash = Some(remote_identity_hash);
        }
        self.transition(conn, ConnectionState::OfferAccepted);
        let peer = self.peer_source.get_peer_for_endpoint(&self.endpoint_of(conn)).await;
        self.secure
            .secure_for_sending(conn, remote_identity_hash, peer.and_then(|p| p.identity))
            .await?;
        Ok(())
    }

    async fn reject_offer(&self, conn: ConnId, peer_group_id: String) {
        let requester_id = self.agent_id();
        let reply = UnsecuredMessage::PeeringOfferReply {
            peer_group_id,
            local_identity_hash: self.local.identity_hash,
            accepted: false,
        };
        let _ = self.network.send_message(conn, &requester_id, encode_unsecured(&reply)).await;
        self.teardown(conn, Error::UnknownConnection(conn)).await;
    }

    fn endpoint_of(&self, conn: ConnId) -> Endpoint {
        self.state
            .lock()
            .connections
            .get(&conn)
            .and_then(|pc| pc.remote_endpoint.clone())
            .unwrap_or_default()
    }

    /// The secure channel on `conn` finished authenticating the remote side.
    pub async fn on_identity_authenticated(&self, conn: ConnId, remote_identity_hash: Hash) -> Result<()> {
        let endpoint = self.endpoint_of(conn);
        let peer = self.peer_source.get_peer_for_endpoint(&endpoint).await.ok_or(Error::UnknownConnection(conn))?;
        if peer.identity_hash != remote_identity_hash {
            self.teardown(conn, Error::NotOwner { conn, requester: self.agent_id() }).await;
            return Ok(());
        }
        self.transition(conn, ConnectionState::Ready);
        let first_for_endpoint = {
            let mut state = self.state.lock();
            let already_ready = state.ready_peers.contains_key(&endpoint);
            if !already_ready {
                state.ready_peers.insert(endpoint.clone(), peer.clone());
            }
            !already_ready
        };
        if first_for_endpoint {
            debug!(peer_group_id = %self.peer_group_id, %endpoint, "new peer ready");
            self.events.push(MeshEvent::NewPeer {
                peer_group_id: self.peer_group_id.clone(),
                peer,
            });
        }
        Ok(())
    }

    async fn teardown(&self, conn: ConnId, _reason: Error) {
        let (endpoint, requester_id) = {
            let pc = self.state.lock().connections.get(&conn).cloned();
            (pc.as_ref().and_then(|p| p.remote_endpoint.clone()), self.agent_id())
        };
        let _ = self.network.release_connection(conn, &requester_id).await;
        let mut lost_peer = None;
        {
            let mut state = self.state.lock();
            state.connections.remove(&conn);
            if let Some(ep) = &endpoint {
                if let Some(list) = state.connections_per_endpoint.get_mut(ep) {
                    list.retain(|c| *c != conn);
                    if list.is_empty() {
                        state.connections_per_endpoint.remove(ep);
                        if let Some(peer) = state.ready_peers.remove(ep) {
                            lost_peer = Some(peer);
                        }
                    }
                }
                state.chosen_for_deduplication.retain(|_, c| *c != conn);
            }
        }
        if let Some(peer) = lost_peer {
            warn!(peer_group_id = %self.peer_group_id, endpoint = %peer.endpoint, "peer lost");
            self.events.push(MeshEvent::LostPeer {
                peer_group_id: self.peer_group_id.clone(),
                peer,
            });
        }
    }

    async fn deduplicate(&self) -> Result<()> {
        let duplicated: Vec<(Endpoint, Vec<ConnId>)> = {
            let state = self.state.lock();
            state
                .connections_per_endpoint
                .iter()
                .filter(|(_, conns)| conns.len() > 1)
                .map(|(ep, conns)| (ep.clone(), conns.clone()))
                .collect()
        };
        for (endpoint, conns) in duplicated {
            let already_chosen = self.state.lock().chosen_for_deduplication.get(&endpoint).copied();
            if let Some(chosen) = already_chosen {
                if self.state.lock().connections.get(&chosen).map(|c| c.is_ready()).unwrap_or(false) {
                    continue;
                }
            }
            let mut ready: Vec<ConnId> = {
                let state = self.state.lock();
                conns
                    .iter()
                    .copied()
                    .filter(|c| state.connections.get(c).map(|pc| pc.is_ready()).unwrap_or(false))
                    .collect()
            };
            if ready.is_empty() {
                continue;
            }
            ready.sort_unstable();
            let survivor = ready[0];
            self.state.lock().chosen_for_deduplication.insert(endpoint.clone(), survivor);
            self.stats.dedup_resolutions.fetch_add(1, Ordering::Relaxed);
            let requester_id = self.agent_id();
            let msg = SecuredMessage::ChooseConnection {
                peer_group_id: self.peer_group_id.clone(),
            };
            let _ = self.network.send_message(survivor, &requester_id, encode_secured(&msg)).await;
            for loser in ready.into_iter().skip(1) {
                self.teardown(loser, Error::UnknownConnection(loser)).await;
            }
        }
        Ok(())
    }

    /// Handles an incoming `ChooseConnection`: picks the tie-break winner between the proposal
    /// and any already-chosen connection, tears down the rest, and confirms.
    pub async fn on_choose_connection(&self, conn: ConnId) -> Result<()> {
        let endpoint = self.endpoint_of(conn);
        let siblings: Vec<ConnId> = self
            .state
            .lock()
            .connections_per_endpoint
            .get(&endpoint)
            .cloned()
            .unwrap_or_default();
        let existing_choice = self.state.lock().chosen_for_deduplication.get(&endpoint).copied();
        let winner = match existing_choice {
            Some(chosen) => chosen.min(conn),
            None => siblings.iter().copied().min().unwrap_or(conn),
        };
        self.state.lock().chosen_for_deduplication.insert(endpoint, winner);
        for sibling in siblings {
            if sibling != winner {
                self.teardown(sibling, Error::UnknownConnection(sibling)).await;
            }
        }
        let requester_id = self.agent_id();
        let reply = SecuredMessage::ConfirmChosenConnection {
            peer_group_id: self.peer_group_id.clone(),
        };
        self.network.send_message(winner, &requester_id, encode_secured(&reply)).await?;
        Ok(())
    }

    async fn validate_peers(&self) {
        let endpoints: Vec<Endpoint> = self.state.lock().connections_per_endpoint.keys().cloned().collect();
        for endpoint in endpoints {
            if self.peer_source.get_peer_for_endpoint(&endpoint).await.is_none() {
                let conns: Vec<ConnId> = self
                    .state
                    .lock()
                    .connections_per_endpoint
                    .get(&endpoint)
                    .cloned()
                    .unwrap_or_default();
                for conn in conns {
                    self.teardown(conn, Error::UnknownConnection(conn)).await;
                }
            }
        }
    }

    /// Sends application content to a single peer's agent, returning whether it was dispatched.
    pub async fn send_to_peer(&self, endpoint: &Endpoint, agent_id: &str, content: Vec<u8>) -> bool {
        let conn = {
            let state = self.state.lock();
            state
                .connections_per_endpoint
                .get(endpoint)
                .and_then(|conns| conns.iter().copied().find(|c| state.connections.get(c).map(|pc| pc.is_ready()).unwrap_or(false)))
        };
        let conn = match conn {
            Some(c) => c,
            None => return false,
        };
        let msg = SecuredMessage::PeerMessage {
            peer_group_id: self.peer_group_id.clone(),
            agent_id: agent_id.to_string(),
            content,
        };
        let requester_id = self.agent_id();
        self.network.send_message(conn, &requester_id, encode_secured(&msg)).await.is_ok()
    }

    /// Sends application content to every `Ready` peer, returning how many it was dispatched to.
    pub async fn send_to_all_peers(&self, agent_id: &str, content: Vec<u8>) -> usize {
        let endpoints: Vec<Endpoint> = self.state.lock().ready_peers.keys().cloned().collect();
        let mut sent = 0;
        for endpoint in endpoints {
            if self.send_to_peer(&endpoint, agent_id, content.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Whether there is currently no buffered traffic outbound toward `endpoint`. Conservative:
    /// `true` only when a `Ready` connection exists; transports with real send buffers should
    /// refine this via `connection_info`.
    pub async fn peer_send_buffer_is_empty(&self, endpoint: &Endpoint) -> bool {
        let conn = {
            let state = self.state.lock();
            state
                .connections_per_endpoint
                .get(endpoint)
                .and_then(|conns| conns.iter().copied().find(|c| state.connections.get(c).map(|pc| pc.is_ready()).unwrap_or(false)))
        };
        match conn {
            Some(c) => self.network.connection_info(c).await.is_some(),
            None => false,
        }
    }

    /// The peers currently `Ready`.
    pub fn get_peers(&self) -> Vec<PeerInfo> {
        self.state.lock().ready_peers.values().cloned().collect()
    }

    /// A snapshot of cumulative counters.
    pub fn get_stats(&self) -> MeshStatsSnapshot {
        self.stats.snapshot()
    }

    /// The agent's current run state.
    pub fn get_state(&self) -> AgentState {
        *self.run_state.lock()
    }

    /// Begins an idempotent shutdown: marks the agent as no longer ticking and closes all
    /// connections.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.run_state.lock() = AgentState::ShuttingDown;
        let conns: Vec<ConnId> = self.state.lock().connections.keys().copied().collect();
        for conn in conns {
            self.teardown(conn, Error::ShuttingDown).await;
        }
        self.events.close();
        *self.run_state.lock() = AgentState::Stopped;
    }
}

fn encode_unsecured(message: &UnsecuredMessage) -> Vec<u8> {
    format!("{:?}", message).into_bytes()
}

fn encode_secured(message: &SecuredMessage) -> Vec<u8> {
    format!("{:?}", message).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNetwork, SimPeerSource, SimSecureNetwork};

    fn local_peer_info(endpoint: &str) -> PeerInfo {
        use meshgraph_core::{hash_value, Value};
        let hash = hash_value(&Value::Str(endpoint.to_string())).unwrap();
        PeerInfo::new(endpoint, hash)
    }

    #[async_std::test]
    async fn tick_is_single_flighted_under_the_try_lock() {
        let network = Arc::new(SimNetwork::new());
        let secure = Arc::new(SimSecureNetwork::new());
        let peer_source = Arc::new(SimPeerSource::new());
        let agent = PeerGroupAgent::new("group-a", local_peer_info("a"), Config::default(), network, secure, peer_source);
        let _guard = agent.tick_lock.lock();
        assert!(agent.tick().await.is_ok());
    }

    #[async_std::test]
    async fn should_connect_to_peer_rejects_self() {
        let network = Arc::new(SimNetwork::new());
        let secure = Arc::new(SimSecureNetwork::new());
        let peer_source = Arc::new(SimPeerSource::new());
        let local = local_peer_info("a");
        let agent = PeerGroupAgent::new("group-a", local.clone(), Config::default(), network, secure, peer_source);
        assert!(!agent.should_connect_to_peer(&local));
    }

    #[async_std::test]
    async fn lost_peer_fires_exactly_once_per_endpoint_drop() {
        let network = Arc::new(SimNetwork::new());
        let secure = Arc::new(SimSecureNetwork::new());
        let peer_source = Arc::new(SimPeerSource::new());
        let agent = PeerGroupAgent::new("group-a", local_peer_info("a"), Config::default(), network, secure, peer_source);
        let peer = local_peer_info("b");
        agent.state.lock().ready_peers.insert("b".to_string(), peer.clone());
        let mut pc = PeerConnection::new(1, true);
        pc.remote_endpoint = Some("b".to_string());
        agent.state.lock().connections.insert(1, pc);
        agent.state.lock().connections_per_endpoint.insert("b".to_string(), vec![1]);
        let stream = meshgraph_stream::BufferedAsyncStream::new(&agent.events());
        agent.teardown(1, Error::TransportClosed(1)).await;
        let event = stream.recv(Some(Duration::from_millis(100))).unwrap();
        assert!(matches!(event, MeshEvent::LostPeer { .. }));
    }

    #[async_std::test]
    async fn identity_authentication_fires_new_peer_exactly_once() {
        let network = Arc::new(SimNetwork::new());
        let secure = Arc::new(SimSecureNetwork::new());
        let peer_source = Arc::new(SimPeerSource::new());
        let peer = local_peer_info("b");
        peer_source.add_peer(peer.clone());
        let agent = PeerGroupAgent::new("group-a", local_peer_info("a"), Config::default(), network, secure, peer_source);
        agent.state.lock().connections.insert(1, PeerConnection::new(1, true));
        {
            let mut state = agent.state.lock();
            let pc = state.connections.get_mut(&1).unwrap();
            pc.remote_endpoint = Some("b".to_string());
        }
        let stream = meshgraph_stream::BufferedAsyncStream::new(&agent.events());
        agent.on_identity_authenticated(1, peer.identity_hash).await.unwrap();
        agent.on_identity_authenticated(1, peer.identity_hash).await.unwrap();
        assert_eq!(stream.count_available_items(), 1);
        let event = stream.recv(Some(Duration::from_millis(100))).unwrap();
        assert!(matches!(event, MeshEvent::NewPeer { .. }));
    }

    #[async_std::test]
    async fn deduplicate_converges_on_the_lexicographically_smallest_ready_connection() {
        let network = Arc::new(SimNetwork::new());
        let secure = Arc::new(SimSecureNetwork::new());
        let peer_source = Arc::new(SimPeerSource::new());
        let agent = PeerGroupAgent::new("group-a", local_peer_info("a"), Config::default(), network, secure, peer_source);
        {
            let mut state = agent.state.lock();
            let mut higher = PeerConnection::new(7, true);
            higher.remote_endpoint = Some("b".to_string());
            higher.transition(ConnectionState::Ready);
            let mut lower = PeerConnection::new(2, false);
            lower.remote_endpoint = Some("b".to_string());
            lower.transition(ConnectionState::Ready);
            state.connections.insert(7, higher);
            state.connections.insert(2, lower);
            state.connections_per_endpoint.insert("b".to_string(), vec![7, 2]);
        }
        agent.deduplicate().await.unwrap();
        let state = agent.state.lock();
        assert_eq!(state.chosen_for_deduplication.get("b"), Some(&2));
        assert_eq!(state.connections_per_endpoint.get("b"), Some(&vec![2]));
        assert!(!state.connections.contains_key(&7));
    }
}
