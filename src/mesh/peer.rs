// Per-peer session state
// One PeerSession per remote participant, owned by the manager's peers map.

use std::sync::Arc;
use std::time::Instant;

use crate::signaling::PeerId;

use super::transport::PeerLink;

/// Which side drives the offer/answer exchange. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub struct PeerSession {
    pub remote_id: PeerId,
    pub role: PeerRole,
    pub state: PeerState,
    pub(crate) link: Option<Arc<dyn PeerLink>>,
    /// Candidates that arrived before the remote description was applied
    pub(crate) pending_candidates: Vec<String>,
    pub(crate) remote_description_set: bool,
    pub(crate) connected_notified: bool,
    pub(crate) negotiating_since: Option<Instant>,
}

impl PeerSession {
    pub fn new(remote_id: PeerId, role: PeerRole) -> Self {
        Self {
            remote_id,
            role,
            state: PeerState::New,
            link: None,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            connected_notified: false,
            negotiating_since: None,
        }
    }

    pub(crate) fn begin_negotiating(&mut self) {
        if self.state == PeerState::New {
            self.state = PeerState::Negotiating;
            self.negotiating_since = Some(Instant::now());
        }
    }
}

/// Deterministic initiator election: the lower id initiates, so both sides
/// compute the same answer without coordination. The hub issues numeric user
/// ids, so ids that both parse as integers compare numerically ("10" must
/// not initiate toward "2"); anything else compares lexicographically.
pub fn initiator_toward(local_id: &str, remote_id: &str) -> bool {
    id_less(local_id, remote_id)
}

fn id_less(a: &str, b: &str) -> bool {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) if x != y => x < y,
        _ => a < b,
    }
}
