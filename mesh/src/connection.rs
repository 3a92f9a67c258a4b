//! The state machine a peering attempt walks through from first contact to a `Ready`,
//! application-usable connection.
use crate::transport::{ConnId, Endpoint, InstanceId};
use meshgraph_core::Hash;
use std::time::Instant;

/// Where a single connection sits in the peering handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// We dialed out and are waiting for the transport to report the link up.
    Connecting,
    /// The transport reported an inbound connection; we haven't acted on it yet.
    ReceivingConnection,
    /// The link is up and secured; we're waiting to send or receive a `PeeringOffer`.
    WaitingForOffer,
    /// We've sent a `PeeringOffer` and are waiting for a reply.
    OfferSent,
    /// An offer was exchanged and accepted by both sides; this is a candidate survivor.
    OfferAccepted,
    /// Deduplicated against any other connections to the same peer and ready for
    /// application traffic.
    Ready,
}

/// Tracked state for one connection attempt, secured or not, toward a peer.
#[derive(Clone, Debug)]
pub struct PeerConnection {
    /// The connection id assigned by the transport.
    pub conn: ConnId,
    /// Current handshake state.
    pub state: ConnectionState,
    /// Who initiated the connection: `true` if we dialed out.
    pub outbound: bool,
    /// The remote endpoint, once known.
    pub remote_endpoint: Option<Endpoint>,
    /// The remote identity hash, once authenticated.
    pub remote_identity_hash: Option<Hash>,
    /// The remote process instance id, if the transport reports one.
    pub remote_instance_id: Option<InstanceId>,
    /// When this connection entered its current state, used to detect timeouts.
    pub state_entered_at: Instant,
    /// When this connection was created.
    pub created_at: Instant,
}

impl PeerConnection {
    /// Starts tracking a freshly dialed or accepted connection.
    pub fn new(conn: ConnId, outbound: bool) -> Self {
        let now = Instant::now();
        Self {
            conn,
            state: if outbound {
                ConnectionState::Connecting
            } else {
                ConnectionState::ReceivingConnection
            },
            outbound,
            remote_endpoint: None,
            remote_identity_hash: None,
            remote_instance_id: None,
            state_entered_at: now,
            created_at: now,
        }
    }

    /// Transitions to `state`, resetting the timeout clock.
    pub fn transition(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_entered_at = Instant::now();
    }

    /// True once the connection has cleared the whole handshake.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// True if this connection has sat in a non-terminal state longer than `timeout`.
    pub fn is_timed_out(&self, timeout: std::time::Duration) -> bool {
        self.state != ConnectionState::Ready && self.state_entered_at.elapsed() > timeout
    }

    /// Two connections are to the "same peer" if their identity hashes match, or, absent an
    /// identity, if their endpoints match. A `None` remote instance id on either side is
    /// treated as matching anything rather than as a mismatch, since not every transport
    /// reports one.
    pub fn same_peer_as(&self, other: &PeerConnection) -> bool {
        match (self.remote_identity_hash, other.remote_identity_hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.remote_endpoint.is_some() && self.remote_endpoint == other.remote_endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_connections_start_connecting_and_inbound_start_receiving() {
        assert_eq!(PeerConnection::new(1, true).state, ConnectionState::Connecting);
        assert_eq!(PeerConnection::new(2, false).state, ConnectionState::ReceivingConnection);
    }

    #[test]
    fn transition_resets_the_state_clock_but_not_the_connection() {
        let mut conn = PeerConnection::new(1, true);
        let created = conn.created_at;
        conn.transition(ConnectionState::Ready);
        assert!(conn.is_ready());
        assert_eq!(conn.created_at, created);
    }

    #[test]
    fn same_peer_as_prefers_identity_hash_over_endpoint() {
        use meshgraph_core::hash_value;
        use meshgraph_core::Value;

        let mut a = PeerConnection::new(1, true);
        let mut b = PeerConnection::new(2, false);
        a.remote_endpoint = Some("endpoint-a".into());
        b.remote_endpoint = Some("endpoint-b".into());
        assert!(!a.same_peer_as(&b));

        let h = hash_value(&Value::Str("same-identity".into())).unwrap();
        a.remote_identity_hash = Some(h);
        b.remote_identity_hash = Some(h);
        assert!(a.same_peer_as(&b));
    }
}
