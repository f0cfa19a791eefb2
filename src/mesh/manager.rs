// Peer connection manager
// Owns one negotiation session per remote participant and drives each to
// connected or failed. Runs entirely inside the session loop task; every
// method is invoked for exactly one event at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::signaling::{PeerId, SignalKind, SignalingEnvelope, SignalingHub};

use super::peer::{initiator_toward, PeerRole, PeerSession, PeerState};
use super::registry::ChannelRegistry;
use super::transport::{LinkEventSender, PeerConnector};
use super::MeshEvent;

pub(crate) struct PeerManager {
    local_id: PeerId,
    hub: Arc<dyn SignalingHub>,
    connector: Arc<dyn PeerConnector>,
    link_events: LinkEventSender,
    events_out: UnboundedSender<MeshEvent>,
    negotiation_timeout: Duration,
    peers: HashMap<PeerId, PeerSession>,
}

impl PeerManager {
    pub(crate) fn new(
        local_id: PeerId,
        hub: Arc<dyn SignalingHub>,
        connector: Arc<dyn PeerConnector>,
        link_events: LinkEventSender,
        events_out: UnboundedSender<MeshEvent>,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            local_id,
            hub,
            connector,
            link_events,
            events_out,
            negotiation_timeout,
            peers: HashMap::new(),
        }
    }

    /// A participant is present in the room. Idempotent: duplicate join
    /// notifications for a known peer are ignored.
    pub(crate) async fn handle_peer_joined(
        &mut self,
        name: &str,
        id: &PeerId,
        registry: &mut ChannelRegistry,
    ) {
        if *id == self.local_id {
            debug!("Ignoring self join notification");
            return;
        }
        if self.peers.contains_key(id) {
            debug!("Duplicate join notification for {}; ignoring", id);
            return;
        }

        let role = if initiator_toward(&self.local_id, id) {
            PeerRole::Initiator
        } else {
            PeerRole::Responder
        };
        info!("Peer joined: {} ({}), local role {:?}", name, id, role);

        let mut session = PeerSession::new(id.clone(), role);
        session.begin_negotiating();
        self.peers.insert(id.clone(), session);

        match role {
            PeerRole::Initiator => {
                // Create the channel eagerly, offer right away
                let link = match self
                    .connector
                    .open_link(id, true, self.link_events.clone())
                    .await
                {
                    Ok(link) => link,
                    Err(e) => {
                        warn!("Failed to open link to {}: {}", id, e);
                        self.fail_session(id, registry).await;
                        return;
                    }
                };
                registry.attach(id, link.clone());
                if let Some(session) = self.peers.get_mut(id) {
                    session.link = Some(link.clone());
                } else {
                    // Closed while the link was opening
                    link.close().await;
                    return;
                }

                let offer = match link.create_offer().await {
                    Ok(offer) => offer,
                    Err(e) => {
                        warn!("Offer creation for {} failed: {}", id, e);
                        self.fail_session(id, registry).await;
                        return;
                    }
                };
                if !self.peers.contains_key(id) {
                    debug!("Session {} closed before offer could be sent", id);
                    return;
                }

                crate::debug::log("NEGOTIATION", &format!("Sending offer to {}", id));
                self.hub
                    .send_signal(id, SignalKind::Offer, offer)
                    .await;
            }
            PeerRole::Responder => {
                debug!("Waiting for offer from {}", id);
            }
        }
    }

    /// A participant left the room. Forces the session closed regardless of
    /// its current state; idempotent if already gone.
    pub(crate) async fn handle_peer_left(&mut self, id: &PeerId, registry: &mut ChannelRegistry) {
        if self.peers.contains_key(id) {
            info!("Peer left: {}", id);
            self.cleanup_session(id, registry, true).await;
        }
    }

    pub(crate) async fn handle_signal(
        &mut self,
        envelope: SignalingEnvelope,
        registry: &mut ChannelRegistry,
    ) {
        match envelope.kind {
            SignalKind::Offer => {
                self.handle_offer(&envelope.from, &envelope.payload, registry)
                    .await
            }
            SignalKind::Answer => {
                self.handle_answer(&envelope.from, &envelope.payload, registry)
                    .await
            }
            SignalKind::IceCandidate => {
                self.handle_candidate(&envelope.from, envelope.payload).await
            }
        }
    }

    /// Inbound offer. May create the session: an offer can overtake our own
    /// peer-joined notification, and a remote-initiated offer always puts us
    /// in the responder role, whatever the id ordering says.
    async fn handle_offer(&mut self, from: &PeerId, sdp: &str, registry: &mut ChannelRegistry) {
        match self.peers.get(from) {
            None => {
                info!("Offer from {} ahead of join notification; responding", from);
                let mut session = PeerSession::new(from.clone(), PeerRole::Responder);
                session.begin_negotiating();
                self.peers.insert(from.clone(), session);
            }
            Some(session) if session.state == PeerState::Connected => {
                warn!("Duplicate offer for connected session {}; discarding", from);
                return;
            }
            Some(session) if session.role == PeerRole::Initiator => {
                // Glare should be impossible under lower-id-initiates
                warn!("Offer from {} but local side initiates; discarding", from);
                return;
            }
            Some(_) => {}
        }

        // Responders build their link on first contact
        let link = match self.peers.get(from).and_then(|s| s.link.clone()) {
            Some(link) => link,
            None => {
                let link = match self
                    .connector
                    .open_link(from, false, self.link_events.clone())
                    .await
                {
                    Ok(link) => link,
                    Err(e) => {
                        warn!("Failed to open link to {}: {}", from, e);
                        self.fail_session(from, registry).await;
                        return;
                    }
                };
                registry.attach(from, link.clone());
                match self.peers.get_mut(from) {
                    Some(session) => session.link = Some(link.clone()),
                    None => {
                        link.close().await;
                        return;
                    }
                }
                link
            }
        };

        crate::debug::log("NEGOTIATION", &format!("Applying offer from {}", from));
        let answer = match link.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to apply offer from {}: {}", from, e);
                self.fail_session(from, registry).await;
                return;
            }
        };

        // The session may have closed while the answer was being generated
        let Some(session) = self.peers.get_mut(from) else {
            debug!("Session {} closed during answer generation; discarding", from);
            return;
        };
        if session.state == PeerState::Closed {
            return;
        }
        session.remote_description_set = true;

        self.flush_candidates(from).await;
        self.hub
            .send_signal(from, SignalKind::Answer, answer)
            .await;
    }

    /// Inbound answer. Must land on an initiator session that is still
    /// negotiating; anything else is a stale or duplicate message.
    async fn handle_answer(&mut self, from: &PeerId, sdp: &str, registry: &mut ChannelRegistry) {
        let Some(session) = self.peers.get(from) else {
            warn!("Answer from {} for unknown session; discarding", from);
            return;
        };
        if session.role != PeerRole::Initiator || session.state != PeerState::Negotiating {
            warn!(
                "Stale answer from {} (role {:?}, state {:?}); discarding",
                from, session.role, session.state
            );
            return;
        }
        let Some(link) = session.link.clone() else {
            warn!("Answer from {} but no link; discarding", from);
            return;
        };

        crate::debug::log("NEGOTIATION", &format!("Applying answer from {}", from));
        if let Err(e) = link.accept_answer(sdp).await {
            warn!("Failed to apply answer from {}: {}", from, e);
            // Session may already be gone if events raced ahead of us
            if self.peers.contains_key(from) {
                self.fail_session(from, registry).await;
            }
            return;
        }

        if let Some(session) = self.peers.get_mut(from) {
            if session.state == PeerState::Closed {
                debug!("Session {} closed while answer applied; ignoring", from);
                return;
            }
            session.remote_description_set = true;
        }
        self.flush_candidates(from).await;
    }

    /// Inbound ICE candidate. Candidates can outrun the offer or answer they
    /// belong to; until the remote description is in place they are queued
    /// on the session and flushed afterwards.
    async fn handle_candidate(&mut self, from: &PeerId, candidate: String) {
        let Some(session) = self.peers.get_mut(from) else {
            warn!("Candidate from {} for unknown session; discarding", from);
            return;
        };

        if session.remote_description_set {
            if let Some(link) = session.link.clone() {
                if let Err(e) = link.add_remote_candidate(&candidate).await {
                    // A bad candidate is not fatal; others may still connect us
                    warn!("Failed to apply candidate from {}: {}", from, e);
                }
                return;
            }
        }

        debug!("Buffering candidate from {} until description is set", from);
        session.pending_candidates.push(candidate);
    }

    async fn flush_candidates(&mut self, id: &PeerId) {
        let (link, queued) = {
            let Some(session) = self.peers.get_mut(id) else {
                return;
            };
            let Some(link) = session.link.clone() else {
                return;
            };
            (link, std::mem::take(&mut session.pending_candidates))
        };

        if !queued.is_empty() {
            debug!("Applying {} buffered candidates from {}", queued.len(), id);
        }
        for candidate in queued {
            if let Err(e) = link.add_remote_candidate(&candidate).await {
                warn!("Failed to apply buffered candidate from {}: {}", id, e);
            }
        }
    }

    /// Transport reports the link is up.
    pub(crate) fn handle_link_connected(&mut self, id: &PeerId) {
        let Some(session) = self.peers.get_mut(id) else {
            debug!("Connected report for unknown session {}; ignoring", id);
            return;
        };

        session.state = PeerState::Connected;
        session.negotiating_since = None;

        // The transport may report connected more than once; notify once
        if !session.connected_notified {
            session.connected_notified = true;
            info!("Peer connection established with {}", id);
            crate::debug::log("NEGOTIATION", &format!("Connected to {}", id));
            let _ = self.events_out.send(MeshEvent::PeerConnected { id: id.clone() });
        }
    }

    /// Transport reports the link failed or closed.
    pub(crate) async fn handle_link_disconnected(
        &mut self,
        id: &PeerId,
        registry: &mut ChannelRegistry,
    ) {
        let Some(session) = self.peers.get_mut(id) else {
            debug!("Disconnect report for unknown session {}; ignoring", id);
            return;
        };

        session.state = match session.state {
            PeerState::Connected => PeerState::Disconnected,
            PeerState::Closed => PeerState::Closed,
            _ => PeerState::Failed,
        };
        info!("Peer {} transport down (now {:?})", id, session.state);
        self.cleanup_session(id, registry, true).await;
    }

    /// Fail and clean up every session stuck negotiating for too long.
    pub(crate) async fn sweep_timeouts(&mut self, registry: &mut ChannelRegistry) {
        let expired: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| {
                s.state == PeerState::Negotiating
                    && s.negotiating_since
                        .map(|t| t.elapsed() > self.negotiation_timeout)
                        .unwrap_or(false)
            })
            .map(|s| s.remote_id.clone())
            .collect();

        for id in expired {
            warn!(
                "Negotiation with {} timed out after {:?}; failing session",
                id, self.negotiation_timeout
            );
            self.fail_session(&id, registry).await;
        }
    }

    /// Close every session without emitting per-peer events. Local teardown.
    pub(crate) async fn close_all(&mut self, registry: &mut ChannelRegistry) {
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.cleanup_session(&id, registry, false).await;
        }
        registry.clear();
    }

    fn mark_failed(&mut self, id: &PeerId) {
        if let Some(session) = self.peers.get_mut(id) {
            session.state = PeerState::Failed;
        }
    }

    async fn fail_session(&mut self, id: &PeerId, registry: &mut ChannelRegistry) {
        self.mark_failed(id);
        self.cleanup_session(id, registry, true).await;
    }

    /// Terminal cleanup: release the channel, drop the session, optionally
    /// notify the application. Idempotent.
    async fn cleanup_session(&mut self, id: &PeerId, registry: &mut ChannelRegistry, notify: bool) {
        let Some(mut session) = self.peers.remove(id) else {
            return;
        };
        session.state = PeerState::Closed;

        if let Some(link) = session.link.take() {
            link.close().await;
        }
        registry.detach(id);
        debug!("Session with {} closed", id);

        if notify {
            let _ = self.events_out.send(MeshEvent::PeerLeft { id: id.clone() });
        }
    }

    pub(crate) fn connected_peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|s| s.state == PeerState::Connected)
            .map(|s| s.remote_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn sessions(&self) -> Vec<(PeerId, PeerState, PeerRole)> {
        let mut sessions: Vec<_> = self
            .peers
            .values()
            .map(|s| (s.remote_id.clone(), s.state, s.role))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    #[cfg(test)]
    pub(crate) fn session(&self, id: &str) -> Option<&PeerSession> {
        self.peers.get(id)
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::loopback::LoopbackNetwork;
    use crate::mesh::transport::LinkEvent;
    use crate::signaling::{HubEvent, MemoryHubRouter};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Rig {
        manager: PeerManager,
        registry: ChannelRegistry,
        link_rx: mpsc::UnboundedReceiver<(PeerId, LinkEvent)>,
        events_rx: mpsc::UnboundedReceiver<MeshEvent>,
    }

    /// Manager wired to the memory hub and loopback links, with the event
    /// channels exposed for direct inspection.
    async fn rig(
        router: &std::sync::Arc<MemoryHubRouter>,
        network: &std::sync::Arc<LoopbackNetwork>,
        local_id: &str,
    ) -> (Rig, mpsc::UnboundedReceiver<HubEvent>) {
        let hub = std::sync::Arc::new(router.client());
        let hub_rx = hub.join("arena", local_id, local_id).await.unwrap();

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = PeerManager::new(
            local_id.to_string(),
            hub,
            std::sync::Arc::new(network.connector(local_id)),
            link_tx,
            events_tx,
            Duration::from_secs(5),
        );

        (
            Rig {
                manager,
                registry: ChannelRegistry::new(),
                link_rx,
                events_rx,
            },
            hub_rx,
        )
    }

    #[tokio::test]
    async fn test_duplicate_peer_joined_is_idempotent() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "1").await;

        rig.manager
            .handle_peer_joined("bob", &"2".to_string(), &mut rig.registry)
            .await;
        rig.manager
            .handle_peer_joined("bob", &"2".to_string(), &mut rig.registry)
            .await;

        assert_eq!(rig.manager.session_count(), 1);
        let session = rig.manager.session("2").unwrap();
        assert_eq!(session.role, PeerRole::Initiator);
        assert_eq!(session.state, PeerState::Negotiating);
    }

    #[tokio::test]
    async fn test_self_join_is_ignored() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "1").await;

        rig.manager
            .handle_peer_joined("me", &"1".to_string(), &mut rig.registry)
            .await;
        assert_eq!(rig.manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_higher_id_waits_as_responder() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "5").await;

        rig.manager
            .handle_peer_joined("alice", &"2".to_string(), &mut rig.registry)
            .await;

        let session = rig.manager.session("2").unwrap();
        assert_eq!(session.role, PeerRole::Responder);
        // Responders have no link until the offer shows up
        assert!(session.link.is_none());
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered_then_flushed() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "5").await;

        // Raw hub client standing in for the remote initiator
        let remote = router.client();
        let mut remote_rx = remote.join("arena", "2", "alice").await.unwrap();
        let _ = remote_rx.recv().await; // drain our own presence

        rig.manager
            .handle_peer_joined("alice", &"2".to_string(), &mut rig.registry)
            .await;

        // Candidate outruns the offer: buffered, not dropped
        rig.manager
            .handle_candidate(&"2".to_string(), "cand-1".to_string())
            .await;
        assert_eq!(rig.manager.session("2").unwrap().pending_candidates.len(), 1);

        // Remote link must exist for the loopback pair to answer
        let (remote_link_tx, _remote_link_rx) = mpsc::unbounded_channel();
        let _remote_link = network
            .connector("2")
            .open_link(&"5".to_string(), true, remote_link_tx)
            .await
            .unwrap();

        rig.manager
            .handle_offer(&"2".to_string(), "offer:2->5", &mut rig.registry)
            .await;

        // Description applied: buffer flushed, answer relayed back
        let session = rig.manager.session("2").unwrap();
        assert!(session.remote_description_set);
        assert!(session.pending_candidates.is_empty());

        match remote_rx.recv().await.unwrap() {
            HubEvent::Signal(env) => {
                assert_eq!(env.kind, crate::signaling::SignalKind::Answer);
                assert_eq!(env.from, "5");
            }
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsolicited_offer_creates_responder_session() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        // Local id "1" would normally initiate toward "2" — but the offer
        // from "2" got here before our join notification did
        let (mut rig, _hub_rx) = rig(&router, &network, "1").await;

        let remote = router.client();
        let mut remote_rx = remote.join("arena", "2", "bob").await.unwrap();
        let _ = remote_rx.recv().await;

        let (remote_link_tx, _remote_link_rx) = mpsc::unbounded_channel();
        let _remote_link = network
            .connector("2")
            .open_link(&"1".to_string(), true, remote_link_tx)
            .await
            .unwrap();

        rig.manager
            .handle_offer(&"2".to_string(), "offer:2->1", &mut rig.registry)
            .await;

        let session = rig.manager.session("2").unwrap();
        assert_eq!(session.role, PeerRole::Responder);
        assert_eq!(session.state, PeerState::Negotiating);

        // A join notification arriving late must not disturb the session
        rig.manager
            .handle_peer_joined("bob", &"2".to_string(), &mut rig.registry)
            .await;
        assert_eq!(rig.manager.session_count(), 1);
        assert_eq!(rig.manager.session("2").unwrap().role, PeerRole::Responder);
    }

    #[tokio::test]
    async fn test_answer_for_unknown_session_is_discarded() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "1").await;

        rig.manager
            .handle_answer(&"9".to_string(), "answer:9->1", &mut rig.registry)
            .await;
        assert_eq!(rig.manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_offer_on_connected_session_is_discarded() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "5").await;

        let remote = router.client();
        let mut remote_rx = remote.join("arena", "2", "alice").await.unwrap();
        let _ = remote_rx.recv().await;

        let (remote_link_tx, mut remote_link_rx) = mpsc::unbounded_channel();
        let remote_link = network
            .connector("2")
            .open_link(&"5".to_string(), true, remote_link_tx)
            .await
            .unwrap();

        rig.manager
            .handle_peer_joined("alice", &"2".to_string(), &mut rig.registry)
            .await;
        rig.manager
            .handle_offer(&"2".to_string(), "offer:2->5", &mut rig.registry)
            .await;

        // Remote applies our answer; both loopback sides report connected
        remote_link.accept_answer("answer:5->2").await.unwrap();
        let (id, _) = rig.link_rx.recv().await.unwrap();
        assert_eq!(id, "2");
        rig.manager.handle_link_connected(&"2".to_string());
        assert_eq!(rig.manager.session("2").unwrap().state, PeerState::Connected);
        let _ = remote_link_rx.recv().await;

        // Replay of the same offer must not move the session
        rig.manager
            .handle_offer(&"2".to_string(), "offer:2->5", &mut rig.registry)
            .await;
        assert_eq!(rig.manager.session("2").unwrap().state, PeerState::Connected);
    }

    #[tokio::test]
    async fn test_connected_notification_fires_once() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "1").await;

        rig.manager
            .handle_peer_joined("bob", &"2".to_string(), &mut rig.registry)
            .await;

        rig.manager.handle_link_connected(&"2".to_string());
        rig.manager.handle_link_connected(&"2".to_string());

        match rig.events_rx.try_recv().unwrap() {
            MeshEvent::PeerConnected { id } => assert_eq!(id, "2"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rig.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_left_forces_cleanup() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "1").await;

        rig.manager
            .handle_peer_joined("bob", &"2".to_string(), &mut rig.registry)
            .await;
        rig.manager.handle_peer_left(&"2".to_string(), &mut rig.registry).await;
        assert_eq!(rig.manager.session_count(), 0);

        match rig.events_rx.try_recv().unwrap() {
            MeshEvent::PeerLeft { id } => assert_eq!(id, "2"),
            other => panic!("unexpected event: {:?}", other),
        }

        // Second notification is a no-op
        rig.manager.handle_peer_left(&"2".to_string(), &mut rig.registry).await;
        assert!(rig.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_negotiation_timeout_fails_session() {
        let router = MemoryHubRouter::new();
        let network = LoopbackNetwork::new();
        let (mut rig, _hub_rx) = rig(&router, &network, "5").await;
        rig.manager.negotiation_timeout = Duration::from_millis(10);

        // Responder waiting on an offer that never comes
        rig.manager
            .handle_peer_joined("ghost", &"2".to_string(), &mut rig.registry)
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        rig.manager.sweep_timeouts(&mut rig.registry).await;

        assert_eq!(rig.manager.session_count(), 0);
        match rig.events_rx.try_recv().unwrap() {
            MeshEvent::PeerLeft { id } => assert_eq!(id, "2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
