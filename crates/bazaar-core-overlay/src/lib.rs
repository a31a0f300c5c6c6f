//! Peer-group overlay core for the bazaar trading network.
//!
//! Maintains a live mesh of mutually authenticated peer connections on top
//! of a lower transport (an anonymizing overlay whose addresses are opaque
//! strings). The group bootstraps from seed addresses, learns further peers
//! through gossip, authenticates each peer with a nonce round-trip, bounds
//! the connection count with tiered eviction, probes liveness, and fans
//! application payloads out to the authenticated set.
//!
//! The transport itself (sockets, framing, session crypto) is out of scope
//! and consumed through the [`Transport`] trait. See [`PeerGroup`] for the
//! public surface.

pub mod address;
pub mod connection;
pub mod group;
pub mod handshake;
pub mod message;
pub mod peer_table;
pub mod scheduler;
pub mod transport;

pub use address::NodeAddress;
pub use connection::{Connection, ConnectionId, ConnectionType};
pub use group::{InboundBroadcast, PeerGroup, PeerGroupSnapshot};
pub use message::WireMessage;
pub use scheduler::{DelayRange, Scheduler, TimerHandle};
pub use transport::{DisconnectReason, SendOutcome, Transport, TransportEvent};

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the peer group.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("transport send failed: {0}")]
    SendFailed(String),

    #[error("authentication handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: NodeAddress, reason: String },

    #[error("an authentication handshake is already in progress for {0}")]
    HandshakeInProgress(NodeAddress),

    #[error("peer address mismatch: expected {expected}, connection bound to {actual}")]
    AddressMismatch {
        expected: NodeAddress,
        actual: NodeAddress,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("local overlay address is not yet known")]
    LocalAddressUnknown,

    #[error("peer group is shut down")]
    ShutDown,
}

pub type Result<T, E = OverlayError> = std::result::Result<T, E>;

/// Peer group tuning. All limits and timings are set at construction; there
/// are no process-wide knobs.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Target connection count; bootstrap stops once reached, and eviction
    /// of passive connections starts above it.
    pub max_connections_low_prio: usize,
    /// Above this, active (outbound) connections become evictable too.
    pub max_connections_normal_prio: usize,
    /// Above this, any authenticated connection except those finalizing an
    /// inbound handshake is evictable.
    pub max_connections_high_prio: usize,
    /// Idle time after which a peer gets pinged on the maintenance tick.
    pub ping_after_inactivity: Duration,
    /// Cap on the reported (known but not connected) address set.
    pub max_reported_peers: usize,
    /// Policy limit on a single gossiped address list; senders exceeding it
    /// are disconnected as misbehaving.
    pub max_reported_peers_per_message: usize,
    /// Back-off before bootstrap retries.
    pub bootstrap_retry_delay: DelayRange,
    /// Maintenance (capacity check + ping) tick interval.
    pub ping_interval: DelayRange,
    /// Peer-list exchange tick interval.
    pub get_peers_interval: DelayRange,
    /// Delay before re-checking capacity after an eviction.
    pub capacity_recheck_delay: DelayRange,
    /// Per-peer jitter applied to ping sends.
    pub ping_send_jitter: DelayRange,
    /// Per-peer jitter applied to get-peers sends.
    pub get_peers_send_jitter: DelayRange,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_connections_low_prio: 8,
            max_connections_normal_prio: 12,
            max_connections_high_prio: 16,
            ping_after_inactivity: Duration::from_secs(30),
            max_reported_peers: 1000,
            max_reported_peers_per_message: 1100,
            bootstrap_retry_delay: DelayRange::new(
                Duration::from_secs(60),
                Duration::from_secs(120),
            ),
            ping_interval: DelayRange::new(Duration::from_secs(300), Duration::from_secs(600)),
            get_peers_interval: DelayRange::new(
                Duration::from_secs(60),
                Duration::from_secs(120),
            ),
            capacity_recheck_delay: DelayRange::new(
                Duration::from_millis(100),
                Duration::from_millis(500),
            ),
            ping_send_jitter: DelayRange::new(
                Duration::from_millis(1),
                Duration::from_millis(10),
            ),
            get_peers_send_jitter: DelayRange::new(
                Duration::from_millis(5),
                Duration::from_millis(10),
            ),
        }
    }
}
