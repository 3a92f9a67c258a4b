//! Peer-group membership coordination: discovery, peering offers, secure-channel handshakes,
//! duplicate-connection deduplication, and liveness management for a named group of replicas.
pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod sim;
pub mod transport;

pub use agent::{AgentState, MeshEvent, MeshStats, MeshStatsSnapshot, PeerGroupAgent};
pub use config::Config;
pub use connection::{ConnectionState, PeerConnection};
pub use error::{Error, Result};
pub use transport::{
    agent_id_for_group, ConnId, ConnectionInfo, Endpoint, InstanceId, NetworkAgent, NetworkEvent, PeerInfo, PeerSource,
    SecureEvent, SecureNetworkAgent, SecuredMessage, TransportStatus, UnsecuredMessage,
};
