//! The external collaborators the peer group agent consumes: `NetworkAgent` (unsecured
//! transport), `SecureNetworkAgent` (authenticated channels), and `PeerSource` (group
//! membership lookup), plus the wire messages and identifiers exchanged between agents.
use async_trait::async_trait;
use meshgraph_core::{Hash, Identity};
use std::sync::Arc;

/// A signaling-layer address at which a replica listens.
pub type Endpoint = String;

/// A locally-assigned connection identifier, unique for the lifetime of the owning
/// `NetworkAgent`.
pub type ConnId = u64;

/// Pins a remote process instance to an endpoint so that e.g. two browser tabs under the same
/// identity don't confuse the mesh into treating them as one peer.
pub type InstanceId = u64;

/// A replica identified by its signaling endpoint and identity.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    /// Where to reach this peer.
    pub endpoint: Endpoint,
    /// Hash of the peer's `Identity`.
    pub identity_hash: Hash,
    /// The peer's identity, if known (public key only, ordinarily).
    pub identity: Option<Arc<Identity>>,
}

impl PeerInfo {
    /// Builds a `PeerInfo` for a peer whose identity is known only by hash.
    pub fn new(endpoint: impl Into<Endpoint>, identity_hash: Hash) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity_hash,
            identity: None,
        }
    }

    /// Attaches the full identity object.
    pub fn with_identity(mut self, identity: Arc<Identity>) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Up/down signal for a connection as reported by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportStatus {
    /// The underlying byte-duplex connection is established.
    Up,
    /// The underlying byte-duplex connection has closed.
    Down,
}

/// Connection metadata the transport can report back to the agent.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// The remote endpoint, if known.
    pub remote_endpoint: Option<Endpoint>,
    /// The remote process instance id, if the transport reports one. `None` is treated as
    /// "matches anything" rather than a mismatch, since not every transport can report one.
    pub remote_instance_id: Option<InstanceId>,
    /// Current up/down status.
    pub status: TransportStatus,
}

/// Events an unsecured `NetworkAgent` delivers to the agent driving it.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// A candidate endpoint answered a listening-address query.
    RemoteAddressListening {
        /// The endpoint that answered.
        endpoint: Endpoint,
    },
    /// A connection's transport status changed.
    ConnectionStatusChange {
        /// The connection affected.
        conn: ConnId,
        /// Its new status.
        status: TransportStatus,
    },
    /// Bytes arrived on an unsecured connection.
    MessageReceived {
        /// The connection the message arrived on.
        conn: ConnId,
        /// The raw message bytes.
        message: Vec<u8>,
    },
}

/// The low-level transport: listening, dialing, accepting, and raw message delivery over
/// byte-duplex connections. Encryption, rendezvous, and wire framing are this trait's
/// implementor's concern, not the agent's.
#[async_trait]
pub trait NetworkAgent: Send + Sync {
    /// Starts listening at `endpoint` under `identity_hash`.
    async fn listen(&self, endpoint: &Endpoint, identity_hash: Hash) -> crate::error::Result<()>;

    /// Dials `remote` from `local`, returning the new connection's id.
    async fn connect(&self, local: &Endpoint, remote: &Endpoint, requester_id: &str) -> crate::error::Result<ConnId>;

    /// Accepts an inbound connection that is currently pending.
    async fn accept_connection(&self, conn: ConnId, requester_id: &str) -> crate::error::Result<()>;

    /// Tears down a connection.
    async fn release_connection(&self, conn: ConnId, requester_id: &str) -> crate::error::Result<()>;

    /// Checks whether a connection is still alive.
    async fn check_connection(&self, conn: ConnId) -> crate::error::Result<bool>;

    /// Sends an unsecured message over `conn`.
    async fn send_message(&self, conn: ConnId, requester_id: &str, message: Vec<u8>) -> crate::error::Result<()>;

    /// Returns what the transport currently knows about `conn`.
    async fn connection_info(&self, conn: ConnId) -> Option<ConnectionInfo>;

    /// Asks `candidates` whether they are listening, relative to `self_endpoint`. Answers
    /// surface asynchronously as `NetworkEvent::RemoteAddressListening`.
    async fn query_for_listening_addresses(
        &self,
        self_endpoint: &Endpoint,
        candidates: &[Endpoint],
    ) -> crate::error::Result<()>;
}

/// Events a `SecureNetworkAgent` delivers once a channel has been secured.
#[derive(Clone, Debug)]
pub enum SecureEvent {
    /// The remote side of `conn` authenticated as `remote_identity_hash`.
    ConnectionIdentityAuth {
        /// The connection that was authenticated.
        conn: ConnId,
        /// The authenticated remote identity.
        remote_identity_hash: Hash,
    },
    /// An authenticated payload arrived.
    SecureMessageReceived {
        /// The connection the payload arrived on.
        conn: ConnId,
        /// The decrypted payload.
        payload: Vec<u8>,
    },
}

/// Upgrades a raw `NetworkAgent` connection into an authenticated, encrypted channel.
#[async_trait]
pub trait SecureNetworkAgent: Send + Sync {
    /// Prepares `conn` to receive a secure handshake as `local_identity`.
    async fn secure_for_receiving(&self, conn: ConnId, local_identity: Arc<Identity>) -> crate::error::Result<()>;

    /// Initiates a secure handshake on `conn`, authenticating the remote as
    /// `remote_identity_hash`.
    async fn secure_for_sending(
        &self,
        conn: ConnId,
        remote_identity_hash: Hash,
        remote_identity: Option<Arc<Identity>>,
    ) -> crate::error::Result<()>;

    /// Sends `payload` over the secured channel on `conn`.
    async fn send_securely(
        &self,
        conn: ConnId,
        local_identity_hash: Hash,
        remote_identity_hash: Hash,
        requester_id: &str,
        payload: Vec<u8>,
    ) -> crate::error::Result<()>;
}

/// Looks up candidate peers for a named group.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Returns up to `count` known peers, in no particular order.
    async fn get_peers(&self, count: usize) -> Vec<PeerInfo>;

    /// Returns the peer this group recognizes at `endpoint`, if any.
    async fn get_peer_for_endpoint(&self, endpoint: &Endpoint) -> Option<PeerInfo>;
}

/// Unsecured peering negotiation, exchanged before a channel is authenticated.
#[derive(Clone, Debug)]
pub enum UnsecuredMessage {
    /// Proposes forming a peering relationship for `peer_group_id`.
    PeeringOffer {
        /// The group this offer is for.
        peer_group_id: String,
        /// The offering side's identity hash.
        local_identity_hash: Hash,
    },
    /// Answers a `PeeringOffer`.
    PeeringOfferReply {
        /// The group this reply is for.
        peer_group_id: String,
        /// The replying side's identity hash.
        local_identity_hash: Hash,
        /// Whether the offer was accepted.
        accepted: bool,
    },
}

/// Control and application messages exchanged once a channel is secured.
#[derive(Clone, Debug)]
pub enum SecuredMessage {
    /// Proposes the sender's connection as the survivor of a duplicate-connection dedup.
    ChooseConnection {
        /// The group this choice applies to.
        peer_group_id: String,
    },
    /// Confirms a `ChooseConnection` proposal.
    ConfirmChosenConnection {
        /// The group this confirmation applies to.
        peer_group_id: String,
    },
    /// An application-layer message routed to a specific agent on the peer.
    PeerMessage {
        /// The group this message belongs to.
        peer_group_id: String,
        /// The recipient agent id within the peer.
        agent_id: String,
        /// The opaque application payload.
        content: Vec<u8>,
    },
}

/// The `agentId` a peer group's own control traffic is routed under.
pub fn agent_id_for_group(peer_group_id: &str) -> String {
    format!("peer-control-for-{}", peer_group_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_follows_the_documented_format() {
        assert_eq!(agent_id_for_group("lobby"), "peer-control-for-lobby");
    }
}
