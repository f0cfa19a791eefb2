// P2P mesh module for teammesh
// Peer negotiation state machine, data channel registry, and the session
// facade the game layer talks to.

pub mod coordinator;
pub mod loopback;
pub mod manager;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod webrtc;

use serde_json::Value;

pub use crate::signaling::PeerId;
pub use coordinator::{ConnectOptions, MeshSession, PeerStatus, SessionStatus};
pub use peer::{PeerRole, PeerState};
pub use protocol::AppEnvelope;
pub use registry::MessageHandler;
pub use transport::{LinkEvent, NegotiationError, PeerConnector, PeerLink};
pub use webrtc::WebRtcConnector;

/// Session-level notifications delivered to the embedding game layer.
#[derive(Debug)]
pub enum MeshEvent {
    /// A peer's transport reached connected state. Fires at most once per
    /// peer for its entire lifecycle.
    PeerConnected { id: PeerId },

    /// A peer's data channel opened for the first time; it can now receive.
    /// Hosts use this to push authoritative initial state.
    PeerReady { id: PeerId },

    /// A peer disconnected, failed to negotiate, or left the room.
    PeerLeft { id: PeerId },

    /// Application message whose type has no registered handler.
    Message {
        from: PeerId,
        kind: String,
        payload: Value,
    },
}
