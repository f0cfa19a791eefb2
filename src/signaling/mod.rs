// Signaling transport adapter for teammesh
// Abstracts the relay hub into room join/leave, targeted signal delivery,
// and peer presence events. The hub only carries negotiation traffic;
// game data flows over the peer data channels once they are up.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub use memory::{MemoryHub, MemoryHubRouter};
pub use ws::WsHub;

pub type PeerId = String;

/// The three kinds of connection-negotiation messages relayed by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// One relayed negotiation message. The payload is an opaque string produced
/// and consumed by the negotiation engine; it round-trips unchanged.
#[derive(Debug, Clone)]
pub struct SignalingEnvelope {
    pub from: PeerId,
    pub to: PeerId,
    pub kind: SignalKind,
    pub payload: String,
}

/// Events surfaced by a hub adapter after joining a room.
#[derive(Debug, Clone)]
pub enum HubEvent {
    PeerJoined { name: String, id: PeerId },
    PeerLeft { id: PeerId },
    Signal(SignalingEnvelope),
}

/// Errors from the signaling layer. Fatal on join; swallowed (logged)
/// everywhere else.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("hub connection failed: {0}")]
    Connect(String),

    #[error("hub rejected join: {0}")]
    Rejected(String),

    #[error("hub connection closed")]
    Closed,
}

/// Wire messages exchanged with the relay hub (JSON text over WebSocket)
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Join a named room under a peer id
    Join {
        room: String,
        peer_id: String,
        name: String,
    },

    /// Server response to a successful join
    JoinOk { room: String, peer_id: String },

    /// Leave the room (closing the socket implies it too)
    Leave { room: String },

    /// Another participant is present in the room
    PeerJoined { name: String, peer_id: String },

    /// A participant left the room
    PeerLeft { peer_id: String },

    /// Send an SDP offer to a peer
    Offer {
        target: String,
        from: String,
        sdp: String,
    },

    /// Send an SDP answer to a peer
    Answer {
        target: String,
        from: String,
        sdp: String,
    },

    /// Send an ICE candidate to a peer
    IceCandidate {
        target: String,
        from: String,
        candidate: String,
    },

    /// Error response
    Error { message: String },
}

impl HubMessage {
    /// Build the wire form of one outbound signal.
    pub fn signal(target: &str, from: &str, kind: SignalKind, payload: String) -> Self {
        match kind {
            SignalKind::Offer => HubMessage::Offer {
                target: target.to_string(),
                from: from.to_string(),
                sdp: payload,
            },
            SignalKind::Answer => HubMessage::Answer {
                target: target.to_string(),
                from: from.to_string(),
                sdp: payload,
            },
            SignalKind::IceCandidate => HubMessage::IceCandidate {
                target: target.to_string(),
                from: from.to_string(),
                candidate: payload,
            },
        }
    }
}

/// A bidirectional connection to the relay hub.
#[async_trait]
pub trait SignalingHub: Send + Sync {
    /// Join `room` under `local_id`. On success returns the stream of hub
    /// events for the room. Callers retry; the adapter does not.
    async fn join(
        &self,
        room: &str,
        local_id: &str,
        name: &str,
    ) -> Result<UnboundedReceiver<HubEvent>, TransportError>;

    /// Leave the room. Best-effort: already-disconnected is not an error.
    async fn leave(&self, room: &str);

    /// Relay one negotiation message to `target`. Fire-and-forget: delivery
    /// failures are logged, never raised (the remote may have left).
    async fn send_signal(&self, target: &str, kind: SignalKind, payload: String);
}
