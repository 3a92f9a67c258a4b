//! Errors the peer group agent and its transport collaborators can report.
use crate::transport::ConnId;
use thiserror::Error;

/// Errors produced while maintaining a peer group's connection mesh.
#[derive(Error, Debug)]
pub enum Error {
    /// A connection did not reach `Ready` before `Config::peer_connection_timeout` elapsed.
    #[error("connection {0} timed out before reaching Ready")]
    ConnectionTimeout(ConnId),

    /// The transport reported a connection as closed.
    #[error("transport reported connection {0} closed")]
    TransportClosed(ConnId),

    /// An incoming offer named a different group than this agent is running.
    #[error("peer group id mismatch: expected {expected}, got {actual}")]
    PeerGroupMismatch {
        /// This agent's group id.
        expected: String,
        /// The group id the offer claimed.
        actual: String,
    },

    /// An operation referenced a connection id this agent has no record of.
    #[error("no connection {0} known to this agent")]
    UnknownConnection(ConnId),

    /// A requester id on a connection action didn't match the recorded owner.
    #[error("requester {requester} is not the owner of connection {conn}")]
    NotOwner {
        /// The connection in question.
        conn: ConnId,
        /// The rejected requester id.
        requester: String,
    },

    /// The agent has shut down and refuses further operations.
    #[error("agent is shutting down")]
    ShuttingDown,

    /// A secure handshake was requested but the local `PeerInfo` carries no private identity
    /// to authenticate with.
    #[error("no local identity available to secure connection {0}")]
    MissingLocalIdentity(ConnId),
}

/// Convenience alias for this crate's fallible results.
pub type Result<T> = std::result::Result<T, Error>;
