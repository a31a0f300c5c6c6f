//! Wire messages exchanged between peer groups.
//!
//! The on-the-wire encoding belongs to the lower transport; these types only
//! name the messages and their payloads. The serde derives mark the encoding
//! seam for whatever codec the transport plugs in.

use crate::address::NodeAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A message routed through the peer group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First handshake message. The requester introduces itself and poses a
    /// freshness challenge.
    AuthenticationRequest {
        sender: NodeAddress,
        requester_nonce: u64,
    },
    /// Second handshake message. The responder echoes the requester's nonce
    /// and poses its own challenge.
    AuthenticationResponse {
        sender: NodeAddress,
        requester_nonce: u64,
        responder_nonce: u64,
    },
    /// Final handshake message. The requester echoes the responder's nonce,
    /// binding the connection to both addresses.
    AuthenticationConfirmation {
        sender: NodeAddress,
        responder_nonce: u64,
    },
    /// Liveness probe.
    Ping { nonce: u64 },
    /// Liveness reply, echoing the probe nonce.
    Pong { nonce: u64 },
    /// Peer-list exchange request, carrying the sender's known addresses.
    GetPeersRequest {
        sender: NodeAddress,
        known_peers: HashSet<NodeAddress>,
    },
    /// Peer-list exchange reply.
    GetPeersResponse { known_peers: HashSet<NodeAddress> },
    /// Opaque application payload fanned out to the authenticated set.
    DataBroadcast { payload: Vec<u8> },
}

impl WireMessage {
    /// Short name of the message kind, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::AuthenticationRequest { .. } => "AUTH_REQUEST",
            WireMessage::AuthenticationResponse { .. } => "AUTH_RESPONSE",
            WireMessage::AuthenticationConfirmation { .. } => "AUTH_CONFIRMATION",
            WireMessage::Ping { .. } => "PING",
            WireMessage::Pong { .. } => "PONG",
            WireMessage::GetPeersRequest { .. } => "GET_PEERS_REQUEST",
            WireMessage::GetPeersResponse { .. } => "GET_PEERS_RESPONSE",
            WireMessage::DataBroadcast { .. } => "DATA_BROADCAST",
        }
    }
}
