// Seam between the mesh state machine and the negotiation engine
// The manager drives offer/answer/candidate calls through PeerLink; the
// engine reports connection and channel activity back as tagged LinkEvents.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::signaling::PeerId;

/// Asynchronous notifications from a peer link. The connector tags each
/// event with the remote id before it reaches the session loop.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A local ICE candidate to relay to the remote side
    LocalCandidate(String),

    /// Underlying transport reached connected state
    Connected,

    /// Underlying transport lost or closed
    Disconnected,

    /// The logical data channel is open for traffic
    ChannelOpen,

    /// One application text frame from the remote
    ChannelMessage(String),

    /// The logical data channel closed
    ChannelClosed,
}

pub type LinkEventSender = UnboundedSender<(PeerId, LinkEvent)>;

/// Failure while driving a single peer's negotiation. Fatal only to the
/// owning session.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("malformed session description: {0}")]
    BadDescription(String),

    #[error("malformed ice candidate: {0}")]
    BadCandidate(String),

    #[error("negotiation engine failure: {0}")]
    Engine(String),
}

/// The data channel is not open (yet, or anymore).
#[derive(Debug, Error)]
#[error("data channel not open")]
pub struct ChannelClosed;

/// One connection-negotiation session toward a single remote participant.
/// Descriptions and candidates are opaque strings that round-trip through
/// the signaling layer unchanged.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produce the local offer. Initiator side only.
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Apply a remote offer and produce the local answer. Responder side only.
    async fn accept_offer(&self, offer: &str) -> Result<String, NegotiationError>;

    /// Apply the remote answer to our earlier offer.
    async fn accept_answer(&self, answer: &str) -> Result<(), NegotiationError>;

    /// Apply one remote ICE candidate. Requires the remote description.
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError>;

    /// Queue one text frame on the logical channel.
    async fn send_frame(&self, frame: &str) -> Result<(), ChannelClosed>;

    /// Tear down the link. Idempotent.
    async fn close(&self);
}

/// Factory for peer links. Initiators get their logical channel created
/// eagerly; responders receive it from the remote side once negotiation
/// completes.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open_link(
        &self,
        remote_id: &PeerId,
        initiator: bool,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
