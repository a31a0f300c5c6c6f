//! The peer table.
//!
//! Three indexed sets, disjoint by address: authenticated peers, reported
//! (known but not connected) addresses, and in-flight handshakes. Every
//! mutation path keeps the sets disjoint, keeps the local address out of the
//! reported set, and keeps the reported set under its cap.

use crate::address::NodeAddress;
use crate::connection::{Connection, ConnectionId};
use crate::handshake::Handshake;
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// An authenticated remote node bound to a live connection.
#[derive(Debug)]
pub struct Peer {
    pub address: NodeAddress,
    pub connection: Connection,
    ping_nonce: u64,
}

impl Peer {
    pub fn new(address: NodeAddress, connection: Connection) -> Self {
        Self {
            address,
            connection,
            ping_nonce: rand::random::<u64>(),
        }
    }

    /// The nonce this peer must echo in its pongs.
    pub fn ping_nonce(&self) -> u64 {
        self.ping_nonce
    }
}

/// The three disjoint peer sets.
#[derive(Default)]
pub struct PeerTable {
    authenticated: HashMap<NodeAddress, Peer>,
    reported: HashSet<NodeAddress>,
    handshakes: HashMap<NodeAddress, Handshake>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticated(&self) -> &HashMap<NodeAddress, Peer> {
        &self.authenticated
    }

    pub fn authenticated_count(&self) -> usize {
        self.authenticated.len()
    }

    pub fn is_authenticated(&self, address: &NodeAddress) -> bool {
        self.authenticated.contains_key(address)
    }

    pub fn peer(&self, address: &NodeAddress) -> Option<&Peer> {
        self.authenticated.get(address)
    }

    /// Record a successful authentication. The address leaves the reported
    /// set and any handshake entry.
    pub fn add_authenticated(&mut self, peer: Peer) {
        let address = peer.address.clone();
        self.handshakes.remove(&address);
        self.reported.remove(&address);
        self.authenticated.insert(address, peer);
        self.debug_check();
    }

    /// Drop an address from all three sets. Returns whether anything changed.
    pub fn remove_peer(&mut self, address: &NodeAddress) -> bool {
        let had_handshake = self.handshakes.remove(address).is_some();
        let was_reported = self.reported.remove(address);
        let was_authenticated = self.authenticated.remove(address).is_some();
        had_handshake || was_reported || was_authenticated
    }

    pub fn reported(&self) -> &HashSet<NodeAddress> {
        &self.reported
    }

    pub fn has_handshake(&self, address: &NodeAddress) -> bool {
        self.handshakes.contains_key(address)
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.len()
    }

    pub fn handshake_addresses(&self) -> HashSet<NodeAddress> {
        self.handshakes.keys().cloned().collect()
    }

    pub fn insert_handshake(&mut self, handshake: Handshake) {
        let address = handshake.peer_address().clone();
        self.handshakes.insert(address, handshake);
        self.debug_check();
    }

    pub fn handshake_mut(&mut self, address: &NodeAddress) -> Option<&mut Handshake> {
        self.handshakes.get_mut(address)
    }

    pub fn take_handshake(&mut self, address: &NodeAddress) -> Option<Handshake> {
        self.handshakes.remove(address)
    }

    /// Address of the in-flight handshake running on `connection_id`, if any.
    /// Used when a connection dies before an address is bound to it.
    pub fn handshake_peer_for_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Option<NodeAddress> {
        self.handshakes
            .values()
            .find(|h| h.connection_id() == Some(connection_id))
            .map(|h| h.peer_address().clone())
    }

    /// Merge gossiped addresses into the reported set.
    ///
    /// The local address and already-authenticated addresses never enter the
    /// set. If the merge overflows `cap`, random pre-existing addresses are
    /// purged first; the fresh batch is only eaten into when it alone
    /// exceeds the cap.
    pub fn merge_reported(
        &mut self,
        mut addresses: HashSet<NodeAddress>,
        local: Option<&NodeAddress>,
        cap: usize,
    ) {
        if let Some(local) = local {
            addresses.remove(local);
        }
        addresses.retain(|a| !self.authenticated.contains_key(a));
        let fresh: HashSet<NodeAddress> = addresses
            .iter()
            .filter(|a| !self.reported.contains(*a))
            .cloned()
            .collect();
        self.reported.extend(addresses);
        self.purge_overflow_protecting(cap, &fresh);
        self.debug_check();
    }

    /// Purge random non-authenticated addresses until the reported set fits
    /// under `cap` again.
    pub fn purge_reported_overflow(&mut self, cap: usize) {
        self.purge_overflow_protecting(cap, &HashSet::new());
    }

    fn purge_overflow_protecting(&mut self, cap: usize, protect: &HashSet<NodeAddress>) {
        if self.reported.len() <= cap {
            return;
        }
        let mut rng = rand::thread_rng();
        let mut pool: Vec<NodeAddress> = self
            .reported
            .iter()
            .filter(|a| !self.authenticated.contains_key(*a) && !protect.contains(*a))
            .cloned()
            .collect();
        while self.reported.len() > cap {
            if pool.is_empty() {
                // The protected batch alone exceeds the cap.
                pool = self
                    .reported
                    .iter()
                    .filter(|a| !self.authenticated.contains_key(*a))
                    .cloned()
                    .collect();
                if pool.is_empty() {
                    break;
                }
            }
            let victim = pool.swap_remove(rng.gen_range(0..pool.len()));
            self.reported.remove(&victim);
        }
    }

    /// Pick a uniformly random candidate that is not yet authenticated, and
    /// return it together with the remaining candidates so the caller can
    /// exclude it from the next attempt.
    pub fn random_not_authenticated(
        &self,
        candidates: &HashSet<NodeAddress>,
    ) -> Option<(NodeAddress, HashSet<NodeAddress>)> {
        let mut list: Vec<NodeAddress> = candidates
            .iter()
            .filter(|a| !self.authenticated.contains_key(*a))
            .cloned()
            .collect();
        if list.is_empty() {
            return None;
        }
        let picked = list.swap_remove(rand::thread_rng().gen_range(0..list.len()));
        Some((picked, list.into_iter().collect()))
    }

    /// Union of the reported set and the authenticated peers' addresses; the
    /// payload of a peer-list exchange.
    pub fn all_known_addresses(&self) -> HashSet<NodeAddress> {
        let mut all = self.reported.clone();
        all.extend(self.authenticated.keys().cloned());
        all
    }

    fn debug_check(&self) {
        debug_assert!(
            self.authenticated
                .keys()
                .all(|a| !self.handshakes.contains_key(a)),
            "authenticated and handshake sets overlap"
        );
        debug_assert!(
            self.authenticated.keys().all(|a| !self.reported.contains(a)),
            "authenticated and reported sets overlap"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionType;
    use crate::handshake::AuthPurpose;

    fn addr(i: usize) -> NodeAddress {
        NodeAddress::new(format!("node{i}.sim"), 4000)
    }

    fn peer(i: usize) -> Peer {
        Peer::new(addr(i), Connection::new(i as u64, ConnectionType::Outbound))
    }

    fn pending_handshake(i: usize) -> Handshake {
        let (handshake, _) = Handshake::request(addr(i), addr(999), AuthPurpose::Reported);
        handshake
    }

    #[test]
    fn test_authentication_clears_other_sets() {
        let mut table = PeerTable::new();
        table.insert_handshake(pending_handshake(1));
        table.merge_reported([addr(1), addr(2)].into(), None, 1000);
        assert!(table.has_handshake(&addr(1)));
        assert!(table.reported().contains(&addr(1)));

        table.add_authenticated(peer(1));
        assert!(table.is_authenticated(&addr(1)));
        assert!(!table.has_handshake(&addr(1)));
        assert!(!table.reported().contains(&addr(1)));
        assert!(table.reported().contains(&addr(2)));
    }

    #[test]
    fn test_remove_peer_clears_all_sets() {
        let mut table = PeerTable::new();
        table.add_authenticated(peer(1));
        table.merge_reported([addr(2)].into(), None, 1000);
        table.insert_handshake(pending_handshake(3));

        assert!(table.remove_peer(&addr(1)));
        assert!(table.remove_peer(&addr(2)));
        assert!(table.remove_peer(&addr(3)));
        assert!(!table.remove_peer(&addr(4)));

        assert_eq!(table.authenticated_count(), 0);
        assert!(table.reported().is_empty());
        assert_eq!(table.handshake_count(), 0);
    }

    #[test]
    fn test_authenticate_then_remove_restores_membership() {
        let mut table = PeerTable::new();
        assert!(!table.is_authenticated(&addr(5)));
        table.add_authenticated(peer(5));
        assert!(table.is_authenticated(&addr(5)));
        table.remove_peer(&addr(5));
        assert!(!table.is_authenticated(&addr(5)));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut table = PeerTable::new();
        let batch: HashSet<NodeAddress> = (0..50).map(addr).collect();
        table.merge_reported(batch.clone(), None, 1000);
        let first = table.reported().clone();
        table.merge_reported(batch, None, 1000);
        assert_eq!(table.reported(), &first);
    }

    #[test]
    fn test_merge_excludes_local_and_authenticated() {
        let mut table = PeerTable::new();
        let local = addr(0);
        table.add_authenticated(peer(1));

        table.merge_reported([addr(0), addr(1), addr(2)].into(), Some(&local), 1000);
        assert!(!table.reported().contains(&local));
        assert!(!table.reported().contains(&addr(1)));
        assert!(table.reported().contains(&addr(2)));
    }

    #[test]
    fn test_purge_keeps_cap_and_protects_fresh_batch() {
        let mut table = PeerTable::new();
        let old: HashSet<NodeAddress> = (0..1000).map(addr).collect();
        table.merge_reported(old.clone(), None, 1000);
        assert_eq!(table.reported().len(), 1000);

        let fresh: HashSet<NodeAddress> = (1000..1050).map(addr).collect();
        table.merge_reported(fresh.clone(), None, 1000);
        assert_eq!(table.reported().len(), 1000);
        for a in &fresh {
            assert!(table.reported().contains(a), "fresh address purged: {a}");
        }
        let surviving_old = table.reported().iter().filter(|a| old.contains(*a)).count();
        assert_eq!(surviving_old, 950);
    }

    #[test]
    fn test_purge_falls_back_when_fresh_batch_exceeds_cap() {
        let mut table = PeerTable::new();
        let batch: HashSet<NodeAddress> = (0..30).map(addr).collect();
        table.merge_reported(batch, None, 10);
        assert_eq!(table.reported().len(), 10);
    }

    #[test]
    fn test_random_not_authenticated_excludes_authenticated() {
        let mut table = PeerTable::new();
        table.add_authenticated(peer(1));
        table.add_authenticated(peer(2));

        let candidates: HashSet<NodeAddress> = [addr(1), addr(2), addr(3)].into();
        let (picked, remaining) = table
            .random_not_authenticated(&candidates)
            .expect("one candidate left");
        assert_eq!(picked, addr(3));
        assert!(remaining.is_empty());

        let exhausted: HashSet<NodeAddress> = [addr(1), addr(2)].into();
        assert!(table.random_not_authenticated(&exhausted).is_none());
    }

    #[test]
    fn test_random_not_authenticated_returns_remainder() {
        let table = PeerTable::new();
        let candidates: HashSet<NodeAddress> = (0..10).map(addr).collect();
        let (picked, remaining) = table.random_not_authenticated(&candidates).unwrap();
        assert_eq!(remaining.len(), 9);
        assert!(!remaining.contains(&picked));
        assert!(candidates.contains(&picked));
    }

    #[test]
    fn test_all_known_addresses_is_union() {
        let mut table = PeerTable::new();
        table.add_authenticated(peer(1));
        table.merge_reported([addr(2), addr(3)].into(), None, 1000);

        let all = table.all_known_addresses();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&addr(1)));
        assert!(all.contains(&addr(2)));
        assert!(all.contains(&addr(3)));
    }

    #[test]
    fn test_handshake_lookup_by_connection() {
        let mut table = PeerTable::new();
        let conn = Connection::new(42, ConnectionType::AuthRequest);
        let (handshake, _) =
            Handshake::respond(addr(0), addr(1), 7, conn.clone(), AuthPurpose::Inbound);
        table.insert_handshake(handshake);

        assert_eq!(table.handshake_peer_for_connection(42), Some(addr(1)));
        assert_eq!(table.handshake_peer_for_connection(43), None);
    }
}
