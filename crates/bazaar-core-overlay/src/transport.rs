//! The lower-transport interface consumed by the peer group.
//!
//! The transport owns sockets, framing, and session establishment; the peer
//! group only sees connection handles, asynchronous send outcomes, and an
//! ordered event stream. Events for a single connection are delivered in
//! arrival order; ordering across connections is unspecified.

use crate::address::NodeAddress;
use crate::connection::Connection;
use crate::message::WireMessage;
use crate::Result;
use tokio::sync::{mpsc, oneshot};

/// Completion handle for an asynchronous send. Resolves with the connection
/// the message went out on, or the send error.
pub type SendOutcome = oneshot::Receiver<Result<Connection>>;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the connection.
    ClosedByPeer,
    /// This side asked the transport to shut the connection down.
    ShutDownLocally,
    /// The transport gave up on the connection.
    TransportError,
}

/// Event delivered by the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A new connection was established (either direction).
    Connected(Connection),
    /// A message arrived on a connection.
    Message {
        message: WireMessage,
        connection: Connection,
    },
    /// A connection went away.
    Disconnected {
        reason: DisconnectReason,
        connection: Connection,
    },
    /// The transport hit an error unrelated to a single message.
    Error(String),
}

/// Lower transport consumed by the peer group.
pub trait Transport: Send + Sync + 'static {
    /// This node's own overlay address. `None` until the transport has
    /// published it.
    fn local_address(&self) -> Option<NodeAddress>;

    /// All connections currently held by the transport.
    fn all_connections(&self) -> Vec<Connection>;

    /// Send a message to an address, opening a connection if none exists.
    fn send_to_address(&self, address: &NodeAddress, message: WireMessage) -> SendOutcome;

    /// Send a message on an existing connection.
    fn send_on_connection(&self, connection: &Connection, message: WireMessage) -> SendOutcome;

    /// Ask the transport to shut a connection down. Completion is observed
    /// through a later [`TransportEvent::Disconnected`].
    fn shut_down_connection(&self, connection: &Connection);

    /// The transport's event stream. Single consumer; the peer group calls
    /// this once at construction.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}
