//! The peer group.
//!
//! Maintains the live mesh of authenticated peers on top of the lower
//! transport: bootstraps from the seed set, discovers further peers through
//! gossip, bounds the connection count with tiered eviction, probes liveness,
//! and fans application payloads out to the authenticated set.
//!
//! All state lives inside one spawned task (the "user thread"): transport
//! events, facade commands, send completions, and timer firings all arrive on
//! a single queue and are handled one at a time, so the peer table is never
//! concurrently mutated. The [`PeerGroup`] handle only posts onto that queue.

use crate::address::NodeAddress;
use crate::connection::{Connection, ConnectionType};
use crate::handshake::{AuthPurpose, Handshake, HandshakeSendKind, HandshakeStep};
use crate::message::WireMessage;
use crate::peer_table::{Peer, PeerTable};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::{DisconnectReason, Transport, TransportEvent};
use crate::{OverlayConfig, OverlayError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Application payload received from an authenticated peer.
#[derive(Debug, Clone)]
pub struct InboundBroadcast {
    pub from: NodeAddress,
    pub payload: Vec<u8>,
}

/// Point-in-time view of the peer table, for callers and tests.
#[derive(Debug, Clone)]
pub struct PeerGroupSnapshot {
    pub authenticated: HashSet<NodeAddress>,
    pub reported: HashSet<NodeAddress>,
    pub handshakes: HashSet<NodeAddress>,
    pub seeds: HashSet<NodeAddress>,
}

#[derive(Debug, Clone, Copy)]
enum BootstrapRetry {
    ReportedPeers { after_seeds: bool },
    SeedNodes,
}

#[derive(Debug)]
enum TimerEvent {
    PingTick,
    GetPeersTick,
    CapacityRecheck,
    BootstrapRetry(BootstrapRetry),
    SendPing(NodeAddress),
    SendGetPeers(NodeAddress),
}

enum Command {
    AuthenticateSeedNode(NodeAddress),
    AuthenticateDirect {
        peer: NodeAddress,
        done: oneshot::Sender<Result<()>>,
    },
    Broadcast {
        payload: Vec<u8>,
        sender: Option<NodeAddress>,
    },
    RemoveSeedAddress(NodeAddress),
    Snapshot(oneshot::Sender<PeerGroupSnapshot>),
    ShutDown,
}

enum Event {
    Transport(TransportEvent),
    Command(Command),
    HandshakeSend {
        peer: NodeAddress,
        kind: HandshakeSendKind,
        result: Result<Connection>,
    },
    SendFailed {
        peer: NodeAddress,
        context: &'static str,
    },
    Timer(TimerEvent),
}

/// Handle to a running peer group.
///
/// Created with [`PeerGroup::new`], which registers on the transport's event
/// stream and starts the maintenance timers. Dropping the handle shuts the
/// group down.
pub struct PeerGroup {
    events_tx: mpsc::UnboundedSender<Event>,
    inbound_tx: broadcast::Sender<InboundBroadcast>,
}

impl PeerGroup {
    /// Start a peer group over `transport` with the given seed addresses.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        seeds: HashSet<NodeAddress>,
        config: OverlayConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _) = broadcast::channel(1024);

        let mut transport_events = transport.subscribe();
        let pump_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                if pump_tx.send(Event::Transport(event)).is_err() {
                    break;
                }
            }
        });

        let core = Core {
            config,
            transport,
            table: PeerTable::new(),
            seeds,
            scheduler: Scheduler::new(events_tx.clone()),
            events_tx: events_tx.clone(),
            events_rx,
            inbound_tx: inbound_tx.clone(),
            ping_timer: None,
            get_peers_timer: None,
            shut_down: false,
        };
        tokio::spawn(core.run());

        Self {
            events_tx,
            inbound_tx,
        }
    }

    /// Kick off the bootstrap cascade against a seed node. Called once the
    /// transport has published this node's own address.
    pub fn authenticate_seed_node(&self, peer: NodeAddress) {
        let _ = self
            .events_tx
            .send(Event::Command(Command::AuthenticateSeedNode(peer)));
    }

    /// Remove an address from the seed set. Used when this node is itself a
    /// seed node.
    pub fn remove_own_seed_address(&self, address: NodeAddress) {
        let _ = self
            .events_tx
            .send(Event::Command(Command::RemoveSeedAddress(address)));
    }

    /// Fan a payload out to every authenticated peer except `sender`.
    /// Silently a no-op while no peer is authenticated.
    pub fn broadcast(&self, payload: Vec<u8>, sender: Option<NodeAddress>) {
        let _ = self
            .events_tx
            .send(Event::Command(Command::Broadcast { payload, sender }));
    }

    /// One-shot authentication for direct messaging. The returned handle
    /// resolves exactly once, with the outcome.
    pub fn authenticate_to_direct_message_peer(
        &self,
        peer: NodeAddress,
    ) -> oneshot::Receiver<Result<()>> {
        let (done, outcome) = oneshot::channel();
        let send = self.events_tx.send(Event::Command(Command::AuthenticateDirect {
            peer,
            done,
        }));
        if let Err(mpsc::error::SendError(event)) = send {
            if let Event::Command(Command::AuthenticateDirect { done, .. }) = event {
                let _ = done.send(Err(OverlayError::ShutDown));
            }
        }
        outcome
    }

    /// Subscribe to application payloads received from authenticated peers.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundBroadcast> {
        self.inbound_tx.subscribe()
    }

    /// Current view of the peer table.
    pub async fn snapshot(&self) -> Result<PeerGroupSnapshot> {
        let (reply, outcome) = oneshot::channel();
        self.events_tx
            .send(Event::Command(Command::Snapshot(reply)))
            .map_err(|_| OverlayError::ShutDown)?;
        outcome.await.map_err(|_| OverlayError::ShutDown)
    }

    /// Shut the peer group down. Idempotent; cancels both maintenance timers.
    /// In-flight handshakes and sends complete or fail without effect.
    pub fn shut_down(&self) {
        let _ = self.events_tx.send(Event::Command(Command::ShutDown));
    }
}

impl Drop for PeerGroup {
    fn drop(&mut self) {
        let _ = self.events_tx.send(Event::Command(Command::ShutDown));
    }
}

/// Pick the connection the capacity manager should shut down, or `None` when
/// the count is within limits or nothing is eligible.
///
/// Tiers: above the low cap only `PASSIVE` connections are candidates; above
/// the normal cap `ACTIVE` joins; above the high cap everything but
/// `AUTH_REQUEST` (those are finalizing an inbound handshake). Among the
/// candidates the least recently active connection loses.
fn eviction_candidate(
    authenticated_count: usize,
    connections: &[Connection],
    config: &OverlayConfig,
) -> Option<Connection> {
    if authenticated_count <= config.max_connections_low_prio {
        return None;
    }
    let authenticated: Vec<&Connection> =
        connections.iter().filter(|c| c.is_authenticated()).collect();

    let mut candidates: Vec<&Connection> = authenticated
        .iter()
        .copied()
        .filter(|c| c.connection_type() == ConnectionType::Passive)
        .collect();
    if candidates.is_empty() && authenticated_count > config.max_connections_normal_prio {
        candidates = authenticated
            .iter()
            .copied()
            .filter(|c| {
                matches!(
                    c.connection_type(),
                    ConnectionType::Passive | ConnectionType::Active
                )
            })
            .collect();
        if candidates.is_empty() && authenticated_count > config.max_connections_high_prio {
            candidates = authenticated
                .iter()
                .copied()
                .filter(|c| c.connection_type() != ConnectionType::AuthRequest)
                .collect();
        }
    }

    candidates
        .into_iter()
        .min_by_key(|c| c.last_activity())
        .cloned()
}

struct Core {
    config: OverlayConfig,
    transport: Arc<dyn Transport>,
    table: PeerTable,
    seeds: HashSet<NodeAddress>,
    scheduler: Scheduler<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    inbound_tx: broadcast::Sender<InboundBroadcast>,
    ping_timer: Option<TimerHandle>,
    get_peers_timer: Option<TimerHandle>,
    shut_down: bool,
}

impl Core {
    async fn run(mut self) {
        self.start_ping_timer();
        self.start_get_peers_timer();
        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event);
            if self.shut_down {
                break;
            }
        }
        debug!("peer group event loop stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Transport(TransportEvent::Connected(connection)) => {
                // Extension point; nothing to do until the peer authenticates.
                trace!(connection = connection.id(), "transport connection established");
            }
            Event::Transport(TransportEvent::Message {
                message,
                connection,
            }) => self.on_message(message, connection),
            Event::Transport(TransportEvent::Disconnected { reason, connection }) => {
                self.on_disconnect(reason, connection)
            }
            Event::Transport(TransportEvent::Error(error)) => {
                // Extension point.
                debug!(%error, "transport error");
            }
            Event::Command(command) => self.on_command(command),
            Event::HandshakeSend { peer, kind, result } => {
                let step = match self.table.handshake_mut(&peer) {
                    Some(handshake) => handshake.on_send_result(kind, result),
                    None => return,
                };
                self.exec_handshake_step(peer, step);
            }
            Event::SendFailed { peer, context } => {
                info!(peer = %peer, context, "send failed; dropping peer");
                self.remove_peer_and_log(&peer);
            }
            Event::Timer(timer) => self.on_timer(timer),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::AuthenticateSeedNode(peer) => {
                let remaining = self.seeds.clone();
                self.authenticate_to_seed_node(remaining, peer, true);
            }
            Command::AuthenticateDirect { peer, done } => self.authenticate_direct(peer, done),
            Command::Broadcast { payload, sender } => self.broadcast(payload, sender),
            Command::RemoveSeedAddress(address) => {
                self.seeds.remove(&address);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::ShutDown => self.shut_down(),
        }
    }

    fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::PingTick => {
                self.check_connected_peers_exceeds();
                self.ping_idle_peers();
                self.start_ping_timer();
            }
            TimerEvent::GetPeersTick => {
                self.send_get_peers_requests();
                self.start_get_peers_timer();
            }
            TimerEvent::CapacityRecheck => {
                self.check_connected_peers_exceeds();
            }
            TimerEvent::BootstrapRetry(BootstrapRetry::ReportedPeers { after_seeds }) => {
                self.authenticate_to_remaining_reported_peers(after_seeds)
            }
            TimerEvent::BootstrapRetry(BootstrapRetry::SeedNodes) => {
                self.authenticate_to_remaining_seed_nodes()
            }
            TimerEvent::SendPing(address) => self.send_ping(address),
            TimerEvent::SendGetPeers(address) => self.send_get_peers_request(address),
        }
    }

    fn snapshot(&self) -> PeerGroupSnapshot {
        PeerGroupSnapshot {
            authenticated: self.table.authenticated().keys().cloned().collect(),
            reported: self.table.reported().clone(),
            handshakes: self.table.handshake_addresses(),
            seeds: self.seeds.clone(),
        }
    }

    fn shut_down(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("shutting down peer group");
        if let Some(timer) = self.ping_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.get_peers_timer.take() {
            timer.cancel();
        }
    }

    // ---- inbound routing ----

    fn on_message(&mut self, message: WireMessage, connection: Connection) {
        trace!(
            kind = message.type_name(),
            connection = connection.id(),
            "message received"
        );
        match message {
            WireMessage::AuthenticationRequest {
                sender,
                requester_nonce,
            } => self.process_authentication_request(sender, requester_nonce, connection),
            WireMessage::AuthenticationResponse { .. }
            | WireMessage::AuthenticationConfirmation { .. } => {
                self.drive_handshake_message(message, connection)
            }
            WireMessage::Ping { nonce } => self.process_ping(nonce, connection),
            WireMessage::Pong { nonce } => self.process_pong(nonce, connection),
            WireMessage::GetPeersRequest {
                sender,
                known_peers,
            } => self.process_get_peers_request(sender, known_peers, connection),
            WireMessage::GetPeersResponse { known_peers } => {
                self.add_to_reported_peers(known_peers, &connection);
            }
            WireMessage::DataBroadcast { payload } => {
                self.process_data_broadcast(payload, connection)
            }
        }
    }

    fn on_disconnect(&mut self, reason: DisconnectReason, connection: Connection) {
        debug!(connection = connection.id(), ?reason, "connection closed");
        match connection.peer_address() {
            Some(address) => self.remove_peer_and_log(&address),
            None => {
                // The connection died mid-handshake, before an address was
                // bound to it. Fail the handshake so its cascade advances.
                if let Some(peer) = self.table.handshake_peer_for_connection(connection.id()) {
                    let err = OverlayError::HandshakeFailed {
                        peer: peer.clone(),
                        reason: "connection closed during handshake".to_string(),
                    };
                    self.on_handshake_failure(peer, err);
                }
            }
        }
    }

    fn process_authentication_request(
        &mut self,
        sender: NodeAddress,
        requester_nonce: u64,
        connection: Connection,
    ) {
        if self.table.has_handshake(&sender) {
            warn!(peer = %sender, "an authentication handshake is already in progress; dropping request");
            return;
        }
        if self.table.is_authenticated(&sender) {
            warn!(peer = %sender, "authentication request from an already authenticated peer; dropping");
            return;
        }
        let Some(local) = self.transport.local_address() else {
            warn!(peer = %sender, "cannot answer authentication request; local address unknown");
            return;
        };
        // Protect the connection from eviction while the handshake finalizes.
        connection.set_connection_type(ConnectionType::AuthRequest);
        let (handshake, step) = Handshake::respond(
            local,
            sender.clone(),
            requester_nonce,
            connection,
            AuthPurpose::Inbound,
        );
        self.table.insert_handshake(handshake);
        self.exec_handshake_step(sender, step);
    }

    fn drive_handshake_message(&mut self, message: WireMessage, connection: Connection) {
        let sender = match &message {
            WireMessage::AuthenticationResponse { sender, .. }
            | WireMessage::AuthenticationConfirmation { sender, .. } => sender.clone(),
            _ => return,
        };
        let step = match self.table.handshake_mut(&sender) {
            Some(handshake) => handshake.on_message(&message, &connection),
            None => {
                warn!(
                    peer = %sender,
                    kind = message.type_name(),
                    "no handshake in progress; dropping message"
                );
                return;
            }
        };
        self.exec_handshake_step(sender, step);
    }

    fn process_ping(&mut self, nonce: u64, connection: Connection) {
        let outcome = self
            .transport
            .send_on_connection(&connection, WireMessage::Pong { nonce });
        match connection.peer_address() {
            Some(address) => self.watch_send(address, "pong", outcome),
            None => drop(outcome),
        }
    }

    fn process_pong(&mut self, nonce: u64, connection: Connection) {
        let Some(address) = connection.peer_address() else {
            return;
        };
        let Some(peer) = self.table.peer(&address) else {
            return;
        };
        if peer.ping_nonce() != nonce {
            warn!(peer = %address, "pong nonce mismatch; dropping peer");
            self.remove_peer_and_log(&address);
            self.transport.shut_down_connection(&connection);
        }
    }

    fn process_get_peers_request(
        &mut self,
        sender: NodeAddress,
        known_peers: HashSet<NodeAddress>,
        connection: Connection,
    ) {
        if !self.add_to_reported_peers(known_peers, &connection) {
            return;
        }
        let known = self.table.all_known_addresses();
        let outcome = self
            .transport
            .send_on_connection(&connection, WireMessage::GetPeersResponse { known_peers: known });
        self.watch_send(sender, "get-peers response", outcome);
    }

    fn process_data_broadcast(&mut self, payload: Vec<u8>, connection: Connection) {
        let Some(from) = connection.peer_address() else {
            debug!("dropping data message from unauthenticated connection");
            return;
        };
        if !self.table.is_authenticated(&from) {
            debug!(peer = %from, "dropping data message from non-peer");
            return;
        }
        let _ = self.inbound_tx.send(InboundBroadcast { from, payload });
    }

    /// Merge a gossiped address list into the reported set. Returns false if
    /// the sender exceeded the policy limit and its connection was shut down.
    fn add_to_reported_peers(
        &mut self,
        addresses: HashSet<NodeAddress>,
        connection: &Connection,
    ) -> bool {
        if addresses.len() > self.config.max_reported_peers_per_message {
            warn!(
                count = addresses.len(),
                limit = self.config.max_reported_peers_per_message,
                "peer list exceeds policy limit; shutting connection down"
            );
            self.transport.shut_down_connection(connection);
            return false;
        }
        let local = self.transport.local_address();
        self.table
            .merge_reported(addresses, local.as_ref(), self.config.max_reported_peers);
        true
    }

    // ---- bootstrap cascade ----

    fn authenticate_to_seed_node(
        &mut self,
        remaining: HashSet<NodeAddress>,
        peer: NodeAddress,
        also_try_reported: bool,
    ) {
        if self.table.is_authenticated(&peer) {
            warn!(peer = %peer, "peer is already authenticated; skipping seed handshake");
            return;
        }
        if self.table.has_handshake(&peer) {
            warn!(peer = %peer, "an authentication handshake is already in progress");
            return;
        }
        let Some(local) = self.transport.local_address() else {
            warn!(peer = %peer, "cannot start handshake; local address unknown");
            return;
        };
        info!(peer = %peer, "authenticating to seed node");
        let (handshake, step) = Handshake::request(
            peer.clone(),
            local,
            AuthPurpose::Seed {
                remaining,
                also_try_reported,
            },
        );
        self.table.insert_handshake(handshake);
        self.exec_handshake_step(peer, step);
    }

    fn authenticate_to_remaining_reported_peers(&mut self, came_from_seeds: bool) {
        if let Some((peer, _)) = self.table.random_not_authenticated(self.table.reported()) {
            info!(peer = %peer, "authenticating to a random reported peer");
            self.authenticate_to_reported_peer(peer);
        } else if came_from_seeds {
            info!("no reported peers for connecting; will retry the seed nodes after a delay");
            self.schedule_bootstrap_retry(BootstrapRetry::SeedNodes);
        } else {
            info!("no reported peers for connecting; trying the remaining seed nodes");
            self.authenticate_to_remaining_seed_nodes();
        }
    }

    fn authenticate_to_remaining_seed_nodes(&mut self) {
        if let Some((peer, remaining)) = self.table.random_not_authenticated(&self.seeds) {
            info!(peer = %peer, "authenticating to a random remaining seed node");
            self.authenticate_to_seed_node(remaining, peer, true);
        } else {
            info!("no seed nodes for connecting; will retry the reported peers after a delay");
            self.schedule_bootstrap_retry(BootstrapRetry::ReportedPeers { after_seeds: false });
        }
    }

    fn authenticate_to_reported_peer(&mut self, peer: NodeAddress) {
        if self.table.is_authenticated(&peer) {
            warn!(peer = %peer, "peer is already authenticated; skipping reported handshake");
            return;
        }
        if self.table.has_handshake(&peer) {
            warn!(peer = %peer, "an authentication handshake is already in progress");
            return;
        }
        let Some(local) = self.transport.local_address() else {
            warn!(peer = %peer, "cannot start handshake; local address unknown");
            return;
        };
        let (handshake, step) = Handshake::request(peer.clone(), local, AuthPurpose::Reported);
        self.table.insert_handshake(handshake);
        self.exec_handshake_step(peer, step);
    }

    fn authenticate_direct(&mut self, peer: NodeAddress, done: oneshot::Sender<Result<()>>) {
        if self.table.is_authenticated(&peer) {
            debug!(peer = %peer, "already authenticated; direct-message authentication is a no-op");
            let _ = done.send(Ok(()));
            return;
        }
        if self.table.has_handshake(&peer) {
            warn!(peer = %peer, "an authentication handshake is already in progress");
            let _ = done.send(Err(OverlayError::HandshakeInProgress(peer)));
            return;
        }
        let Some(local) = self.transport.local_address() else {
            let _ = done.send(Err(OverlayError::LocalAddressUnknown));
            return;
        };
        let (handshake, step) =
            Handshake::request(peer.clone(), local, AuthPurpose::Direct { done });
        self.table.insert_handshake(handshake);
        self.exec_handshake_step(peer, step);
    }

    fn schedule_bootstrap_retry(&mut self, retry: BootstrapRetry) {
        let _ = self.scheduler.run_after_random_delay(
            Event::Timer(TimerEvent::BootstrapRetry(retry)),
            self.config.bootstrap_retry_delay,
        );
    }

    // ---- handshake driving ----

    fn exec_handshake_step(&mut self, peer: NodeAddress, step: HandshakeStep) {
        match step {
            HandshakeStep::SendToAddress {
                address,
                message,
                kind,
            } => {
                let outcome = self.transport.send_to_address(&address, message);
                self.watch_handshake_send(peer, kind, outcome);
            }
            HandshakeStep::SendOnConnection {
                connection,
                message,
                kind,
            } => {
                let outcome = self.transport.send_on_connection(&connection, message);
                self.watch_handshake_send(peer, kind, outcome);
            }
            HandshakeStep::Complete(connection) => self.on_handshake_success(peer, connection),
            HandshakeStep::Failed(err) => self.on_handshake_failure(peer, err),
            HandshakeStep::Ignore => {}
        }
    }

    fn on_handshake_success(&mut self, peer: NodeAddress, connection: Connection) {
        let Some(handshake) = self.table.take_handshake(&peer) else {
            return;
        };
        let purpose = handshake.into_purpose();

        if let Some(bound) = connection.peer_address() {
            if bound != peer {
                error!(
                    expected = %peer,
                    bound = %bound,
                    "connection bound to a different address at handshake completion"
                );
                self.transport.shut_down_connection(&connection);
                self.remove_peer_and_log(&peer);
                if let AuthPurpose::Direct { done } = purpose {
                    let _ = done.send(Err(OverlayError::AddressMismatch {
                        expected: peer,
                        actual: bound,
                    }));
                }
                return;
            }
        }

        let promoted = match connection.connection_type() {
            ConnectionType::AuthRequest | ConnectionType::Inbound => ConnectionType::Passive,
            ConnectionType::Outbound => ConnectionType::Active,
            keep => keep,
        };
        connection.set_connection_type(promoted);
        connection.set_authenticated(peer.clone());

        info!(peer = %peer, connection = connection.id(), "peer authenticated");
        self.table.add_authenticated(Peer::new(peer.clone(), connection));
        if !self.check_connected_peers_exceeds() {
            self.log_peer_snapshot();
        }

        match purpose {
            AuthPurpose::Seed {
                also_try_reported, ..
            } => {
                if also_try_reported
                    && self.table.authenticated_count() < self.config.max_connections_low_prio
                {
                    info!("still below the target connection count; trying reported peers");
                    self.authenticate_to_remaining_reported_peers(true);
                } else {
                    self.schedule_bootstrap_retry(BootstrapRetry::ReportedPeers {
                        after_seeds: true,
                    });
                }
            }
            AuthPurpose::Reported => {
                if self.table.authenticated_count() < self.config.max_connections_low_prio {
                    if !self.table.reported().is_empty() {
                        info!("still below the target connection count; trying the remaining reported peers");
                        self.authenticate_to_remaining_reported_peers(false);
                    } else {
                        info!("no reported peers left; will try the remaining seed nodes after a delay");
                        self.schedule_bootstrap_retry(BootstrapRetry::SeedNodes);
                    }
                } else {
                    info!("target connection count reached");
                }
            }
            AuthPurpose::Direct { done } => {
                let _ = done.send(Ok(()));
            }
            AuthPurpose::Inbound => {
                self.table
                    .purge_reported_overflow(self.config.max_reported_peers);
            }
        }
    }

    fn on_handshake_failure(&mut self, peer: NodeAddress, err: OverlayError) {
        let Some(handshake) = self.table.take_handshake(&peer) else {
            return;
        };
        let purpose = handshake.into_purpose();
        info!(peer = %peer, error = %err, "authentication handshake failed");
        self.remove_peer_and_log(&peer);

        match purpose {
            AuthPurpose::Seed { mut remaining, .. } => {
                remaining.remove(&peer);
                if let Some((next, rest)) = self.table.random_not_authenticated(&remaining) {
                    info!(peer = %next, "trying another seed node");
                    self.authenticate_to_seed_node(rest, next, true);
                } else if !self.table.reported().is_empty() {
                    info!("no seed nodes left; trying reported peers");
                    self.authenticate_to_remaining_reported_peers(true);
                } else {
                    info!("no seed nodes or reported peers left; will retry after a delay");
                    self.schedule_bootstrap_retry(BootstrapRetry::ReportedPeers {
                        after_seeds: true,
                    });
                }
            }
            AuthPurpose::Reported => {
                if !self.table.reported().is_empty() {
                    info!("trying another reported peer");
                    self.authenticate_to_remaining_reported_peers(false);
                } else {
                    info!("no reported peers left; will try the seed nodes after a delay");
                    self.schedule_bootstrap_retry(BootstrapRetry::SeedNodes);
                }
            }
            AuthPurpose::Direct { done } => {
                let _ = done.send(Err(err));
            }
            AuthPurpose::Inbound => {}
        }
    }

    // ---- capacity management ----

    fn check_connected_peers_exceeds(&mut self) -> bool {
        let size = self.table.authenticated_count();
        if size <= self.config.max_connections_low_prio {
            trace!(connections = size, "connection count within limits");
            return false;
        }
        let connections = self.transport.all_connections();
        let authenticated = connections.iter().filter(|c| c.is_authenticated()).count();
        if size != authenticated {
            warn!(
                table = size,
                connections = authenticated,
                "peer table and connection set disagree"
            );
        }
        match eviction_candidate(size, &connections, &self.config) {
            Some(connection) => {
                info!(
                    connection = connection.id(),
                    connections = size,
                    "connection count exceeds limits; shutting down the least recently active connection"
                );
                self.transport.shut_down_connection(&connection);
                let _ = self.scheduler.run_after_random_delay(
                    Event::Timer(TimerEvent::CapacityRecheck),
                    self.config.capacity_recheck_delay,
                );
                true
            }
            None => {
                debug!(
                    connections = size,
                    "connection count exceeds limits but no connection is eligible for eviction"
                );
                false
            }
        }
    }

    // ---- maintenance ----

    fn start_ping_timer(&mut self) {
        if self.shut_down {
            return;
        }
        if let Some(timer) = self.ping_timer.take() {
            timer.cancel();
        }
        self.ping_timer = Some(self.scheduler.run_after_random_delay(
            Event::Timer(TimerEvent::PingTick),
            self.config.ping_interval,
        ));
    }

    fn start_get_peers_timer(&mut self) {
        if self.shut_down {
            return;
        }
        if let Some(timer) = self.get_peers_timer.take() {
            timer.cancel();
        }
        self.get_peers_timer = Some(self.scheduler.run_after_random_delay(
            Event::Timer(TimerEvent::GetPeersTick),
            self.config.get_peers_interval,
        ));
    }

    fn ping_idle_peers(&mut self) {
        let now = Instant::now();
        let idle: Vec<NodeAddress> = self
            .table
            .authenticated()
            .iter()
            .filter(|(_, peer)| {
                now.duration_since(peer.connection.last_activity())
                    > self.config.ping_after_inactivity
            })
            .map(|(address, _)| address.clone())
            .collect();
        if idle.is_empty() {
            return;
        }
        debug!(count = idle.len(), "pinging idle peers");
        for address in idle {
            let _ = self.scheduler.run_after_random_delay(
                Event::Timer(TimerEvent::SendPing(address)),
                self.config.ping_send_jitter,
            );
        }
    }

    fn send_ping(&mut self, address: NodeAddress) {
        let Some(peer) = self.table.peer(&address) else {
            return;
        };
        let outcome = self.transport.send_on_connection(
            &peer.connection,
            WireMessage::Ping {
                nonce: peer.ping_nonce(),
            },
        );
        self.watch_send(address, "ping", outcome);
    }

    fn send_get_peers_requests(&mut self) {
        let peers: Vec<NodeAddress> = self.table.authenticated().keys().cloned().collect();
        for address in peers {
            let _ = self.scheduler.run_after_random_delay(
                Event::Timer(TimerEvent::SendGetPeers(address)),
                self.config.get_peers_send_jitter,
            );
        }
    }

    fn send_get_peers_request(&mut self, address: NodeAddress) {
        let Some(local) = self.transport.local_address() else {
            return;
        };
        let Some(peer) = self.table.peer(&address) else {
            return;
        };
        let known = self.table.all_known_addresses();
        let outcome = self.transport.send_on_connection(
            &peer.connection,
            WireMessage::GetPeersRequest {
                sender: local,
                known_peers: known,
            },
        );
        self.watch_send(address, "get-peers request", outcome);
    }

    // ---- broadcast ----

    fn broadcast(&mut self, payload: Vec<u8>, sender: Option<NodeAddress>) {
        if self.table.authenticated_count() == 0 {
            trace!("data message not broadcast; no authenticated peers yet");
            return;
        }
        debug!(
            peers = self.table.authenticated_count(),
            bytes = payload.len(),
            "broadcasting data message"
        );
        let targets: Vec<(NodeAddress, Connection)> = self
            .table
            .authenticated()
            .iter()
            .filter(|(address, _)| Some(*address) != sender.as_ref())
            .map(|(address, peer)| (address.clone(), peer.connection.clone()))
            .collect();
        for (address, connection) in targets {
            let outcome = self.transport.send_on_connection(
                &connection,
                WireMessage::DataBroadcast {
                    payload: payload.clone(),
                },
            );
            self.watch_send(address, "broadcast", outcome);
        }
    }

    // ---- plumbing ----

    fn watch_send(
        &self,
        peer: NodeAddress,
        context: &'static str,
        outcome: crate::transport::SendOutcome,
    ) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let failed = match outcome.await {
                Ok(Ok(_)) => false,
                Ok(Err(err)) => {
                    debug!(peer = %peer, context, error = %err, "send failed");
                    true
                }
                Err(_) => {
                    debug!(peer = %peer, context, "transport dropped the send");
                    true
                }
            };
            if failed {
                let _ = tx.send(Event::SendFailed { peer, context });
            }
        });
    }

    fn watch_handshake_send(
        &self,
        peer: NodeAddress,
        kind: HandshakeSendKind,
        outcome: crate::transport::SendOutcome,
    ) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match outcome.await {
                Ok(result) => result,
                Err(_) => Err(OverlayError::SendFailed(
                    "transport dropped the send".to_string(),
                )),
            };
            let _ = tx.send(Event::HandshakeSend { peer, kind, result });
        });
    }

    fn remove_peer_and_log(&mut self, address: &NodeAddress) {
        if self.table.remove_peer(address) {
            self.log_peer_snapshot();
        }
    }

    fn log_peer_snapshot(&self) {
        debug!(
            authenticated = self.table.authenticated_count(),
            reported = self.table.reported().len(),
            handshakes = self.table.handshake_count(),
            "peer table changed"
        );
    }
}
