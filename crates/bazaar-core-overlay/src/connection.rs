//! Connection handles.
//!
//! Connections are owned by the transport; the peer group borrows them
//! through these cheap cloneable handles. The core mutates the classification
//! tags and the authenticated binding, the transport updates activity and
//! eventually frees the connection.

use crate::address::NodeAddress;
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

/// Unique id of a connection within one transport.
pub type ConnectionId = u64;

/// Classification of a connection, used by the tiered eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Accepted by the transport, not yet classified by the core.
    Inbound,
    /// Dialed by the transport, not yet classified by the core.
    Outbound,
    /// Inbound connection that completed authentication.
    Passive,
    /// Outbound connection that completed authentication.
    Active,
    /// Currently participating in an inbound handshake. Never evicted.
    AuthRequest,
}

struct ConnectionState {
    peer_address: Option<NodeAddress>,
    authenticated: bool,
    connection_type: ConnectionType,
    last_activity: Instant,
}

struct ConnectionInner {
    id: ConnectionId,
    state: RwLock<ConnectionState>,
}

/// Handle to a transport-owned connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(id: ConnectionId, connection_type: ConnectionType) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                state: RwLock::new(ConnectionState {
                    peer_address: None,
                    authenticated: false,
                    connection_type,
                    last_activity: Instant::now(),
                }),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The peer address bound by a completed handshake, if any.
    pub fn peer_address(&self) -> Option<NodeAddress> {
        self.inner.state.read().peer_address.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.read().authenticated
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.inner.state.read().connection_type
    }

    pub fn set_connection_type(&self, connection_type: ConnectionType) {
        self.inner.state.write().connection_type = connection_type;
    }

    /// Bind the peer address and mark the connection authenticated.
    pub fn set_authenticated(&self, peer_address: NodeAddress) {
        let mut state = self.inner.state.write();
        state.peer_address = Some(peer_address);
        state.authenticated = true;
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.state.read().last_activity
    }

    /// Record activity on the connection. Called by the transport on every
    /// send and delivery.
    pub fn touch(&self) {
        self.inner.state.write().last_activity = Instant::now();
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_address", &state.peer_address)
            .field("authenticated", &state.authenticated)
            .field("connection_type", &state.connection_type)
            .finish()
    }
}
