// teammesh - P2P mesh session layer for TeamHub arcade games
// Establishes a full mesh of WebRTC data channels between every participant
// in a named room, using a relay hub only for connection negotiation.
//
// The game/rendering layer talks to this crate through `MeshSession`:
// connect to a room, register message handlers, send/broadcast JSON game
// messages, and react to peer lifecycle events.

pub mod config;
pub mod debug;
pub mod mesh;
pub mod signaling;

pub use config::Config;
pub use mesh::{ConnectOptions, MeshEvent, MeshSession, PeerId, SessionStatus};
pub use signaling::{SignalKind, SignalingHub, TransportError};
