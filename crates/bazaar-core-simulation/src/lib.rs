//! Simulation harness for the bazaar overlay.
//!
//! Provides an in-memory transport fabric so multi-node peer-group behavior
//! can be exercised without sockets: a [`SimNetwork`] registry connects
//! [`SimTransport`] instances through paired connection handles with ordered
//! delivery. Nodes can be taken offline to inject send failures, raw wire
//! messages can be pushed on live connections, and every send attempt is
//! recorded in a log so tests can assert ordering.

mod logging;

pub use logging::init_test_logging;

use anyhow::{bail, Result};
use bazaar_core_overlay::{
    Connection, ConnectionId, ConnectionType, DelayRange, DisconnectReason, NodeAddress,
    OverlayConfig, OverlayError, PeerGroup, PeerGroupSnapshot, SendOutcome, Transport,
    TransportEvent, WireMessage,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::trace;

/// One recorded send attempt.
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub from: NodeAddress,
    pub to: NodeAddress,
    pub message: WireMessage,
    pub delivered: bool,
}

/// Registry of simulated nodes.
pub struct SimNetwork {
    nodes: DashMap<NodeAddress, Arc<SimTransport>>,
    next_connection_id: AtomicU64,
    log: Mutex<Vec<SendRecord>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Register a node and return its transport.
    pub fn create_node(network: &Arc<SimNetwork>, address: NodeAddress) -> Arc<SimTransport> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(SimTransport {
            address: address.clone(),
            network: Arc::downgrade(network),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            links: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
        });
        network.nodes.insert(address, Arc::clone(&transport));
        transport
    }

    pub fn transport(&self, address: &NodeAddress) -> Option<Arc<SimTransport>> {
        self.nodes.get(address).map(|entry| Arc::clone(entry.value()))
    }

    /// Make sends toward `address` fail. Existing connections stay in place;
    /// peers discover the outage through send failures.
    pub fn set_offline(&self, address: &NodeAddress, offline: bool) {
        if let Some(transport) = self.transport(address) {
            transport.online.store(!offline, Ordering::Relaxed);
        }
    }

    /// `from`'s connection handle toward `to`, if one is open.
    pub fn connection_between(&self, from: &NodeAddress, to: &NodeAddress) -> Option<Connection> {
        self.transport(from)?.connection_to(to)
    }

    /// Snapshot of every send attempt so far, in order.
    pub fn message_log(&self) -> Vec<SendRecord> {
        self.log.lock().clone()
    }

    fn next_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, from: NodeAddress, to: NodeAddress, message: WireMessage, delivered: bool) {
        self.log.lock().push(SendRecord {
            from,
            to,
            message,
            delivered,
        });
    }
}

#[derive(Clone)]
struct SimLink {
    connection: Connection,
    remote_address: NodeAddress,
    remote_connection_id: ConnectionId,
}

/// In-memory transport for one node.
pub struct SimTransport {
    address: NodeAddress,
    network: Weak<SimNetwork>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    links: Mutex<HashMap<ConnectionId, SimLink>>,
    online: AtomicBool,
}

impl SimTransport {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// This node's connection handle toward `remote`, if one is open.
    pub fn connection_to(&self, remote: &NodeAddress) -> Option<Connection> {
        self.links
            .lock()
            .values()
            .find(|link| &link.remote_address == remote)
            .map(|link| link.connection.clone())
    }

    fn deliver(&self, event: TransportEvent) -> bool {
        self.events_tx.send(event).is_ok()
    }

    /// Open a fresh connection pair between two nodes and announce the
    /// inbound side. Returns the dialing side's link.
    fn open_pair(network: &SimNetwork, from: &SimTransport, to: &SimTransport) -> SimLink {
        let local_id = network.next_id();
        let remote_id = network.next_id();
        let local_connection = Connection::new(local_id, ConnectionType::Outbound);
        let remote_connection = Connection::new(remote_id, ConnectionType::Inbound);
        trace!(
            from = %from.address,
            to = %to.address,
            local_id,
            remote_id,
            "opening connection pair"
        );

        let local_link = SimLink {
            connection: local_connection,
            remote_address: to.address.clone(),
            remote_connection_id: remote_id,
        };
        from.links.lock().insert(local_id, local_link.clone());
        to.links.lock().insert(
            remote_id,
            SimLink {
                connection: remote_connection.clone(),
                remote_address: from.address.clone(),
                remote_connection_id: local_id,
            },
        );
        let _ = to.deliver(TransportEvent::Connected(remote_connection));
        local_link
    }

    fn try_send_to_address(
        &self,
        address: &NodeAddress,
        message: WireMessage,
    ) -> Result<Connection, OverlayError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| OverlayError::SendFailed("network is gone".to_string()))?;
        let remote = network
            .transport(address)
            .ok_or_else(|| OverlayError::SendFailed(format!("no route to {address}")))?;
        if !remote.is_online() {
            return Err(OverlayError::SendFailed(format!("{address} is unreachable")));
        }

        let link = match self.connection_to(address) {
            Some(connection) => {
                let links = self.links.lock();
                links
                    .get(&connection.id())
                    .cloned()
                    .ok_or_else(|| OverlayError::SendFailed("connection closed".to_string()))?
            }
            None => Self::open_pair(&network, self, &remote),
        };
        self.deliver_on_link(&remote, &link, message)
    }

    fn try_send_on_connection(
        &self,
        connection: &Connection,
        message: WireMessage,
    ) -> Result<Connection, OverlayError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| OverlayError::SendFailed("network is gone".to_string()))?;
        let link = self
            .links
            .lock()
            .get(&connection.id())
            .cloned()
            .ok_or_else(|| OverlayError::SendFailed("connection closed".to_string()))?;
        let remote = network.transport(&link.remote_address).ok_or_else(|| {
            OverlayError::SendFailed(format!("no route to {}", link.remote_address))
        })?;
        if !remote.is_online() {
            return Err(OverlayError::SendFailed(format!(
                "{} is unreachable",
                link.remote_address
            )));
        }
        self.deliver_on_link(&remote, &link, message)
    }

    fn deliver_on_link(
        &self,
        remote: &SimTransport,
        link: &SimLink,
        message: WireMessage,
    ) -> Result<Connection, OverlayError> {
        let remote_connection = remote
            .links
            .lock()
            .get(&link.remote_connection_id)
            .map(|l| l.connection.clone())
            .ok_or_else(|| OverlayError::SendFailed("connection closed by peer".to_string()))?;
        link.connection.touch();
        remote_connection.touch();
        if !remote.deliver(TransportEvent::Message {
            message,
            connection: remote_connection,
        }) {
            return Err(OverlayError::SendFailed(format!(
                "{} stopped receiving",
                remote.address
            )));
        }
        Ok(link.connection.clone())
    }
}

impl Transport for SimTransport {
    fn local_address(&self) -> Option<NodeAddress> {
        Some(self.address.clone())
    }

    fn all_connections(&self) -> Vec<Connection> {
        self.links
            .lock()
            .values()
            .map(|link| link.connection.clone())
            .collect()
    }

    fn send_to_address(&self, address: &NodeAddress, message: WireMessage) -> SendOutcome {
        let (tx, rx) = oneshot::channel();
        let logged = message.clone();
        let result = self.try_send_to_address(address, message);
        if let Some(network) = self.network.upgrade() {
            network.record(self.address.clone(), address.clone(), logged, result.is_ok());
        }
        let _ = tx.send(result);
        rx
    }

    fn send_on_connection(&self, connection: &Connection, message: WireMessage) -> SendOutcome {
        let (tx, rx) = oneshot::channel();
        let remote_address = self
            .links
            .lock()
            .get(&connection.id())
            .map(|link| link.remote_address.clone());
        let logged = message.clone();
        let result = self.try_send_on_connection(connection, message);
        if let (Some(network), Some(to)) = (self.network.upgrade(), remote_address) {
            network.record(self.address.clone(), to, logged, result.is_ok());
        }
        let _ = tx.send(result);
        rx
    }

    fn shut_down_connection(&self, connection: &Connection) {
        let Some(link) = self.links.lock().remove(&connection.id()) else {
            return;
        };
        trace!(
            from = %self.address,
            to = %link.remote_address,
            id = connection.id(),
            "shutting connection down"
        );
        let _ = self.deliver(TransportEvent::Disconnected {
            reason: DisconnectReason::ShutDownLocally,
            connection: link.connection,
        });
        if let Some(network) = self.network.upgrade() {
            if let Some(remote) = network.transport(&link.remote_address) {
                let removed = remote.links.lock().remove(&link.remote_connection_id);
                if let Some(remote_link) = removed {
                    let _ = remote.deliver(TransportEvent::Disconnected {
                        reason: DisconnectReason::ClosedByPeer,
                        connection: remote_link.connection,
                    });
                }
            }
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events_rx
            .lock()
            .take()
            .expect("transport event stream already taken")
    }
}

/// One simulated node: its address, transport, and peer group.
pub struct SimNode {
    pub address: NodeAddress,
    pub transport: Arc<SimTransport>,
    pub group: PeerGroup,
}

/// A set of simulated nodes sharing one in-memory network.
pub struct OverlaySimulation {
    pub network: Arc<SimNetwork>,
    pub nodes: Vec<SimNode>,
}

impl OverlaySimulation {
    pub fn new() -> Self {
        init_test_logging();
        Self {
            network: SimNetwork::new(),
            nodes: Vec::new(),
        }
    }

    /// Register a node and start a peer group on it.
    pub fn add_node(
        &mut self,
        address: NodeAddress,
        seeds: HashSet<NodeAddress>,
        config: OverlayConfig,
    ) -> &SimNode {
        let transport = SimNetwork::create_node(&self.network, address.clone());
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let group = PeerGroup::new(transport_dyn, seeds, config);
        self.nodes.push(SimNode {
            address,
            transport,
            group,
        });
        self.nodes.last().expect("node just pushed")
    }

    pub fn node(&self, address: &NodeAddress) -> &SimNode {
        self.nodes
            .iter()
            .find(|node| &node.address == address)
            .unwrap_or_else(|| panic!("unknown node {address}"))
    }

    pub async fn snapshot(&self, address: &NodeAddress) -> Result<PeerGroupSnapshot> {
        Ok(self.node(address).group.snapshot().await?)
    }

    /// Poll a node's snapshot until `condition` holds, or fail after
    /// `timeout`.
    pub async fn wait_for<F>(
        &self,
        address: &NodeAddress,
        timeout: Duration,
        condition: F,
    ) -> Result<PeerGroupSnapshot>
    where
        F: Fn(&PeerGroupSnapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot(address).await?;
            if condition(&snapshot) {
                return Ok(snapshot);
            }
            if Instant::now() >= deadline {
                bail!(
                    "condition not met for {address} within {timeout:?}; \
                     last snapshot: {snapshot:?}"
                );
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for OverlaySimulation {
    fn default() -> Self {
        Self::new()
    }
}

/// Overlay config with millisecond timings for simulation tests. Individual
/// tests override fields as the scenario requires.
pub fn fast_config() -> OverlayConfig {
    OverlayConfig {
        bootstrap_retry_delay: DelayRange::new(
            Duration::from_millis(40),
            Duration::from_millis(80),
        ),
        ping_interval: DelayRange::new(Duration::from_millis(60), Duration::from_millis(120)),
        get_peers_interval: DelayRange::new(
            Duration::from_millis(60),
            Duration::from_millis(120),
        ),
        capacity_recheck_delay: DelayRange::new(
            Duration::from_millis(10),
            Duration::from_millis(20),
        ),
        ping_send_jitter: DelayRange::new(Duration::from_millis(1), Duration::from_millis(2)),
        get_peers_send_jitter: DelayRange::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
        ),
        ..OverlayConfig::default()
    }
}

/// Assert the peer-table invariants on a snapshot.
pub fn assert_table_invariants(
    snapshot: &PeerGroupSnapshot,
    local: &NodeAddress,
    max_reported: usize,
) {
    assert!(
        snapshot.authenticated.is_disjoint(&snapshot.handshakes),
        "authenticated and handshake sets overlap"
    );
    assert!(
        snapshot.authenticated.is_disjoint(&snapshot.reported),
        "authenticated and reported sets overlap"
    );
    assert!(
        snapshot.reported.len() <= max_reported,
        "reported set exceeds its cap: {}",
        snapshot.reported.len()
    );
    assert!(
        !snapshot.reported.contains(local),
        "own address present in reported set"
    );
}
