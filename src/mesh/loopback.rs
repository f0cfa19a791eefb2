// In-process peer links for tests and same-process sessions
// Deterministic stand-in for the WebRTC engine: a pair completes when the
// initiator applies the answer, at which point both sides see Connected and
// ChannelOpen; frames are delivered directly to the opposite endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::signaling::PeerId;

use super::transport::{
    ChannelClosed, LinkEvent, LinkEventSender, NegotiationError, PeerConnector, PeerLink,
};

struct Endpoint {
    events: LinkEventSender,
    /// The id this endpoint's session loop knows the other side by
    remote_tag: PeerId,
    open: bool,
}

impl Endpoint {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send((self.remote_tag.clone(), event));
    }
}

/// Shared medium connecting loopback endpoints across sessions in the same
/// process. Keyed by (owner id, remote id); the reverse key is the paired
/// endpoint.
pub struct LoopbackNetwork {
    endpoints: Mutex<HashMap<(PeerId, PeerId), Endpoint>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Connector for one participant; every link it opens registers here.
    pub fn connector(self: &Arc<Self>, local_id: impl Into<PeerId>) -> LoopbackConnector {
        LoopbackConnector {
            network: Arc::clone(self),
            local_id: local_id.into(),
        }
    }

    fn register(&self, local: &PeerId, remote: &PeerId, events: LinkEventSender) {
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints.insert(
            (local.clone(), remote.clone()),
            Endpoint {
                events,
                remote_tag: remote.clone(),
                open: false,
            },
        );
    }

    /// Complete the pair: both endpoints go connected and their channel opens.
    fn complete(&self, local: &PeerId, remote: &PeerId) -> Result<(), NegotiationError> {
        let mut endpoints = self.endpoints.lock().unwrap();

        if !endpoints.contains_key(&(remote.clone(), local.clone())) {
            return Err(NegotiationError::Engine(format!(
                "no answering endpoint for {} -> {}",
                local, remote
            )));
        }

        for key in [
            (local.clone(), remote.clone()),
            (remote.clone(), local.clone()),
        ] {
            let endpoint = endpoints
                .get_mut(&key)
                .ok_or_else(|| NegotiationError::Engine("endpoint vanished".to_string()))?;
            if !endpoint.open {
                endpoint.open = true;
                endpoint.emit(LinkEvent::Connected);
                endpoint.emit(LinkEvent::ChannelOpen);
            }
        }

        Ok(())
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, frame: &str) -> Result<(), ChannelClosed> {
        let endpoints = self.endpoints.lock().unwrap();

        let sender_open = endpoints
            .get(&(from.clone(), to.clone()))
            .map(|e| e.open)
            .unwrap_or(false);
        if !sender_open {
            return Err(ChannelClosed);
        }

        match endpoints.get(&(to.clone(), from.clone())) {
            Some(receiver) if receiver.open => {
                receiver.emit(LinkEvent::ChannelMessage(frame.to_string()));
                Ok(())
            }
            _ => Err(ChannelClosed),
        }
    }

    fn close(&self, local: &PeerId, remote: &PeerId) {
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.remove(&(local.clone(), remote.clone())).is_none() {
            return;
        }

        // Tell the surviving side its transport is gone
        if let Some(other) = endpoints.get_mut(&(remote.clone(), local.clone())) {
            if other.open {
                other.open = false;
                other.emit(LinkEvent::ChannelClosed);
            }
            other.emit(LinkEvent::Disconnected);
        }
        debug!("loopback link {} -> {} closed", local, remote);
    }
}

pub struct LoopbackConnector {
    network: Arc<LoopbackNetwork>,
    local_id: PeerId,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn open_link(
        &self,
        remote_id: &PeerId,
        _initiator: bool,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        self.network.register(&self.local_id, remote_id, events);
        Ok(Arc::new(LoopbackLink {
            network: Arc::clone(&self.network),
            local_id: self.local_id.clone(),
            remote_id: remote_id.clone(),
        }))
    }
}

pub struct LoopbackLink {
    network: Arc<LoopbackNetwork>,
    local_id: PeerId,
    remote_id: PeerId,
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        Ok(format!("offer:{}->{}", self.local_id, self.remote_id))
    }

    async fn accept_offer(&self, _offer: &str) -> Result<String, NegotiationError> {
        Ok(format!("answer:{}->{}", self.local_id, self.remote_id))
    }

    async fn accept_answer(&self, _answer: &str) -> Result<(), NegotiationError> {
        self.network.complete(&self.local_id, &self.remote_id)
    }

    async fn add_remote_candidate(&self, _candidate: &str) -> Result<(), NegotiationError> {
        // Loopback needs no path discovery; accepted and ignored
        Ok(())
    }

    async fn send_frame(&self, frame: &str) -> Result<(), ChannelClosed> {
        self.network.deliver(&self.local_id, &self.remote_id, frame)
    }

    async fn close(&self) {
        self.network.close(&self.local_id, &self.remote_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_pair_completes_on_accept_answer() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = network.connector("1").open_link(&"2".to_string(), true, a_tx).await.unwrap();
        let b = network.connector("2").open_link(&"1".to_string(), false, b_tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.accept_answer(&answer).await.unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            match rx.recv().await.unwrap().1 {
                LinkEvent::Connected => {}
                other => panic!("expected Connected, got {:?}", other),
            }
            match rx.recv().await.unwrap().1 {
                LinkEvent::ChannelOpen => {}
                other => panic!("expected ChannelOpen, got {:?}", other),
            }
        }

        a.send_frame("hello").await.unwrap();
        match b_rx.recv().await.unwrap() {
            (id, LinkEvent::ChannelMessage(frame)) => {
                assert_eq!(id, "1");
                assert_eq!(frame, "hello");
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_answer_without_peer_fails() {
        let network = LoopbackNetwork::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();

        let a = network.connector("1").open_link(&"2".to_string(), true, a_tx).await.unwrap();
        assert!(a.accept_answer("answer:2->1").await.is_err());
    }

    #[tokio::test]
    async fn test_close_notifies_survivor() {
        let network = LoopbackNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();

        let a = network.connector("1").open_link(&"2".to_string(), true, a_tx).await.unwrap();
        let b = network.connector("2").open_link(&"1".to_string(), false, b_tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(&offer).await.unwrap();
        a.accept_answer(&answer).await.unwrap();
        let _ = a_rx.recv().await; // Connected
        let _ = a_rx.recv().await; // ChannelOpen

        b.close().await;
        match a_rx.recv().await.unwrap().1 {
            LinkEvent::ChannelClosed => {}
            other => panic!("expected ChannelClosed, got {:?}", other),
        }
        match a_rx.recv().await.unwrap().1 {
            LinkEvent::Disconnected => {}
            other => panic!("expected Disconnected, got {:?}", other),
        }

        // Frames to a closed pair are refused
        assert!(a.send_frame("late").await.is_err());
    }
}
