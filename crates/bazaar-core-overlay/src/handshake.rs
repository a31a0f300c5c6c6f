//! The authentication handshake.
//!
//! One handshake authenticates one peer address over one connection, through
//! a three-message nonce round-trip:
//!
//! 1. requester -> `AuthenticationRequest { sender, requester_nonce }`
//! 2. responder -> `AuthenticationResponse { sender, requester_nonce, responder_nonce }`
//! 3. requester -> `AuthenticationConfirmation { sender, responder_nonce }`
//!
//! The requester completes once the confirmation send succeeds; the responder
//! completes when the confirmation arrives with its own nonce echoed. Each
//! instance is single-shot: after reporting an outcome it ignores further
//! input, and a new attempt requires a new instance.
//!
//! The state machine performs no I/O itself. Entry points return a
//! [`HandshakeStep`] describing what the event loop must do next, so every
//! transition stays on the single logical executor.

use crate::address::NodeAddress;
use crate::connection::Connection;
use crate::message::WireMessage;
use crate::{OverlayError, Result};
use tokio::sync::oneshot;
use tracing::warn;

/// Which side of the exchange this instance drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Requester,
    Responder,
}

/// Which handshake send a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSendKind {
    Request,
    Response,
    Confirmation,
}

/// Why the handshake was started. Carried through to completion so the event
/// loop can continue the right cascade.
#[derive(Debug)]
pub enum AuthPurpose {
    /// Bootstrap attempt against a seed node, with the not-yet-tried seeds
    /// and whether reported peers should be tried after success.
    Seed {
        remaining: std::collections::HashSet<NodeAddress>,
        also_try_reported: bool,
    },
    /// Bootstrap attempt against a reported peer.
    Reported,
    /// One-shot authentication for direct messaging; resolved exactly once.
    Direct {
        done: oneshot::Sender<Result<()>>,
    },
    /// Response to an inbound authentication request.
    Inbound,
}

/// Next action for the event loop after driving a handshake.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send `message` to `address`, opening a connection if needed, and feed
    /// the outcome back with `kind`.
    SendToAddress {
        address: NodeAddress,
        message: WireMessage,
        kind: HandshakeSendKind,
    },
    /// Send `message` on `connection` and feed the outcome back with `kind`.
    SendOnConnection {
        connection: Connection,
        message: WireMessage,
        kind: HandshakeSendKind,
    },
    /// The remote address is bound to this connection.
    Complete(Connection),
    /// The exchange failed; the instance is spent.
    Failed(OverlayError),
    /// Nothing to do.
    Ignore,
}

#[derive(Debug)]
enum Stage {
    /// Requester: request dispatched, waiting for the response.
    Requesting { requester_nonce: u64 },
    /// Requester: response verified, confirmation dispatch in flight.
    Confirming,
    /// Responder: response dispatched, waiting for the confirmation.
    Responding { responder_nonce: u64 },
    /// Outcome reported; all further input is ignored.
    Done,
}

/// A single in-flight authentication exchange.
#[derive(Debug)]
pub struct Handshake {
    peer_address: NodeAddress,
    local_address: NodeAddress,
    role: HandshakeRole,
    stage: Stage,
    connection: Option<Connection>,
    purpose: AuthPurpose,
}

impl Handshake {
    /// Start an outbound handshake with `peer_address`. Returns the instance
    /// and the initial send.
    pub fn request(
        peer_address: NodeAddress,
        local_address: NodeAddress,
        purpose: AuthPurpose,
    ) -> (Self, HandshakeStep) {
        let requester_nonce = rand::random::<u64>();
        let step = HandshakeStep::SendToAddress {
            address: peer_address.clone(),
            message: WireMessage::AuthenticationRequest {
                sender: local_address.clone(),
                requester_nonce,
            },
            kind: HandshakeSendKind::Request,
        };
        let handshake = Self {
            peer_address,
            local_address,
            role: HandshakeRole::Requester,
            stage: Stage::Requesting { requester_nonce },
            connection: None,
            purpose,
        };
        (handshake, step)
    }

    /// Answer an inbound `AuthenticationRequest` received on `connection`.
    /// Returns the instance and the response send.
    pub fn respond(
        local_address: NodeAddress,
        peer_address: NodeAddress,
        requester_nonce: u64,
        connection: Connection,
        purpose: AuthPurpose,
    ) -> (Self, HandshakeStep) {
        let responder_nonce = rand::random::<u64>();
        let step = HandshakeStep::SendOnConnection {
            connection: connection.clone(),
            message: WireMessage::AuthenticationResponse {
                sender: local_address.clone(),
                requester_nonce,
                responder_nonce,
            },
            kind: HandshakeSendKind::Response,
        };
        let handshake = Self {
            peer_address,
            local_address,
            role: HandshakeRole::Responder,
            stage: Stage::Responding { responder_nonce },
            connection: Some(connection),
            purpose,
        };
        (handshake, step)
    }

    pub fn peer_address(&self) -> &NodeAddress {
        &self.peer_address
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// The connection this handshake currently runs on, if known.
    pub fn connection_id(&self) -> Option<crate::connection::ConnectionId> {
        self.connection.as_ref().map(|c| c.id())
    }

    /// Consume the instance and surface why it was started.
    pub fn into_purpose(self) -> AuthPurpose {
        self.purpose
    }

    /// Feed the outcome of a handshake send back into the state machine.
    pub fn on_send_result(
        &mut self,
        kind: HandshakeSendKind,
        result: Result<Connection>,
    ) -> HandshakeStep {
        match (kind, &self.stage) {
            (HandshakeSendKind::Request, Stage::Requesting { .. }) => match result {
                Ok(connection) => {
                    // The response may already have progressed the exchange on
                    // the connection the transport reported; keep the first.
                    if self.connection.is_none() {
                        self.connection = Some(connection);
                    }
                    HandshakeStep::Ignore
                }
                Err(err) => self.fail(format!("request send failed: {err}")),
            },
            (HandshakeSendKind::Response, Stage::Responding { .. }) => match result {
                Ok(_) => HandshakeStep::Ignore,
                Err(err) => self.fail(format!("response send failed: {err}")),
            },
            (HandshakeSendKind::Confirmation, Stage::Confirming) => match result {
                Ok(connection) => {
                    self.stage = Stage::Done;
                    HandshakeStep::Complete(connection)
                }
                Err(err) => self.fail(format!("confirmation send failed: {err}")),
            },
            // Late completions after the exchange moved on.
            _ => HandshakeStep::Ignore,
        }
    }

    /// Feed an inbound handshake message into the state machine.
    pub fn on_message(&mut self, message: &WireMessage, connection: &Connection) -> HandshakeStep {
        match (message, &self.stage) {
            (
                WireMessage::AuthenticationResponse {
                    sender,
                    requester_nonce,
                    responder_nonce,
                },
                Stage::Requesting {
                    requester_nonce: expected,
                },
            ) => {
                let expected = *expected;
                let responder_nonce = *responder_nonce;
                if sender != &self.peer_address {
                    let claimed = sender.clone();
                    return self.fail(format!(
                        "response claims sender {claimed}, expected {}",
                        self.peer_address
                    ));
                }
                if *requester_nonce != expected {
                    return self.fail("response echoed a stale or foreign nonce".to_string());
                }
                self.connection = Some(connection.clone());
                self.stage = Stage::Confirming;
                HandshakeStep::SendOnConnection {
                    connection: connection.clone(),
                    message: WireMessage::AuthenticationConfirmation {
                        sender: self.local_address.clone(),
                        responder_nonce,
                    },
                    kind: HandshakeSendKind::Confirmation,
                }
            }
            (
                WireMessage::AuthenticationConfirmation {
                    sender,
                    responder_nonce,
                },
                Stage::Responding {
                    responder_nonce: expected,
                },
            ) => {
                let expected = *expected;
                if let Some(own) = &self.connection {
                    if own.id() != connection.id() {
                        return self
                            .fail("confirmation arrived on a different connection".to_string());
                    }
                }
                if sender != &self.peer_address {
                    let claimed = sender.clone();
                    return self.fail(format!(
                        "confirmation claims sender {claimed}, expected {}",
                        self.peer_address
                    ));
                }
                if *responder_nonce != expected {
                    return self.fail("confirmation echoed a stale or foreign nonce".to_string());
                }
                self.stage = Stage::Done;
                HandshakeStep::Complete(connection.clone())
            }
            (message, _) => {
                warn!(
                    peer = %self.peer_address,
                    kind = message.type_name(),
                    "unexpected message for handshake stage; ignoring"
                );
                HandshakeStep::Ignore
            }
        }
    }

    fn fail(&mut self, reason: String) -> HandshakeStep {
        self.stage = Stage::Done;
        HandshakeStep::Failed(OverlayError::HandshakeFailed {
            peer: self.peer_address.clone(),
            reason,
        })
    }
}
