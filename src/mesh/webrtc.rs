// WebRTC peer links
// One RTCPeerConnection per remote participant. Negotiation payloads are
// JSON-serialized session descriptions and ICE candidates; they pass through
// the signaling layer as opaque strings. Candidate gathering and NAT
// traversal are the WebRTC stack's problem, not ours.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::ChannelTuning;
use crate::signaling::PeerId;

use super::transport::{
    ChannelClosed, LinkEvent, LinkEventSender, NegotiationError, PeerConnector, PeerLink,
};

type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// Builds WebRTC-backed peer links.
pub struct WebRtcConnector {
    stun_servers: Vec<String>,
    channel: ChannelTuning,
}

impl WebRtcConnector {
    pub fn new(stun_servers: Vec<String>, channel: ChannelTuning) -> Self {
        Self {
            stun_servers,
            channel,
        }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open_link(
        &self,
        remote_id: &PeerId,
        initiator: bool,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Engine(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config())
                .await
                .map_err(|e| NegotiationError::Engine(e.to_string()))?,
        );
        crate::debug::log(
            "NEGOTIATION",
            &format!("Created peer connection for {} (initiator: {})", remote_id, initiator),
        );

        // Connection state changes feed the session loop as link events
        {
            let events = events.clone();
            let tag = remote_id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let tag = tag.clone();
                Box::pin(async move {
                    debug!("Connection state with {}: {}", tag, state);
                    crate::debug::log("ICE_STATE", &format!("{}: {}", tag, state));
                    match state {
                        RTCPeerConnectionState::Connected => {
                            let _ = events.send((tag.clone(), LinkEvent::Connected));
                        }
                        RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed => {
                            let _ = events.send((tag.clone(), LinkEvent::Disconnected));
                        }
                        _ => {}
                    }
                })
            }));
        }

        // Trickle ICE: every locally gathered candidate is relayed to the
        // remote side through the signaling hub
        {
            let events = events.clone();
            let tag = remote_id.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let tag = tag.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return; // end of gathering
                    };
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_string(&init) {
                            Ok(blob) => {
                                let _ = events.send((tag.clone(), LinkEvent::LocalCandidate(blob)));
                            }
                            Err(e) => warn!("Failed to encode candidate for {}: {}", tag, e),
                        },
                        Err(e) => warn!("Failed to serialize candidate for {}: {}", tag, e),
                    }
                })
            }));
        }

        let slot: ChannelSlot = Arc::new(RwLock::new(None));

        if initiator {
            // Initiators carry the channel in their offer
            let init = RTCDataChannelInit {
                ordered: Some(self.channel.ordered),
                max_retransmits: if self.channel.ordered {
                    None
                } else {
                    Some(self.channel.max_retransmits)
                },
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&self.channel.label, Some(init))
                .await
                .map_err(|e| NegotiationError::Engine(e.to_string()))?;
            wire_channel(&dc, remote_id, &events);
            *slot.write().await = Some(dc);
        } else {
            // Responders receive the channel once negotiation completes
            let slot = slot.clone();
            let events = events.clone();
            let tag = remote_id.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let events = events.clone();
                let tag = tag.clone();
                Box::pin(async move {
                    debug!("Data channel {} received from {}", dc.label(), tag);
                    wire_channel(&dc, &tag, &events);
                    *slot.write().await = Some(dc);
                })
            }));
        }

        Ok(Arc::new(WebRtcLink {
            remote_id: remote_id.clone(),
            pc,
            channel: slot,
        }))
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, remote_id: &PeerId, events: &LinkEventSender) {
    {
        let events = events.clone();
        let tag = remote_id.clone();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let tag = tag.clone();
            Box::pin(async move {
                crate::debug::log("CHANNEL", &format!("Data channel open with {}", tag));
                let _ = events.send((tag.clone(), LinkEvent::ChannelOpen));
            })
        }));
    }

    {
        let events = events.clone();
        let tag = remote_id.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let tag = tag.clone();
            Box::pin(async move {
                // Application envelopes are text frames; anything else is noise
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(frame) => {
                        let _ = events.send((tag.clone(), LinkEvent::ChannelMessage(frame)));
                    }
                    Err(_) => warn!("Dropping non-UTF8 frame from {}", tag),
                }
            })
        }));
    }

    {
        let events = events.clone();
        let tag = remote_id.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            let tag = tag.clone();
            Box::pin(async move {
                crate::debug::log("CHANNEL", &format!("Data channel closed with {}", tag));
                let _ = events.send((tag.clone(), LinkEvent::ChannelClosed));
            })
        }));
    }
}

pub struct WebRtcLink {
    remote_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Engine(e.to_string()))?;

        let candidate_count = offer
            .sdp
            .lines()
            .filter(|l| l.starts_with("a=candidate:"))
            .count();
        crate::debug::log("SDP_OFFER_FULL", &offer.sdp);
        crate::debug::log(
            "SDP_OFFER_CANDIDATES",
            &format!("Offer for {} has {} embedded candidates", self.remote_id, candidate_count),
        );

        let payload = serde_json::to_string(&offer)
            .map_err(|e| NegotiationError::BadDescription(e.to_string()))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| NegotiationError::Engine(e.to_string()))?;
        Ok(payload)
    }

    async fn accept_offer(&self, offer: &str) -> Result<String, NegotiationError> {
        let desc: RTCSessionDescription = serde_json::from_str(offer)
            .map_err(|e| NegotiationError::BadDescription(e.to_string()))?;
        crate::debug::log("SDP_OFFER_FULL", &desc.sdp);

        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::Engine(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Engine(e.to_string()))?;
        crate::debug::log("SDP_ANSWER_FULL", &answer.sdp);

        let payload = serde_json::to_string(&answer)
            .map_err(|e| NegotiationError::BadDescription(e.to_string()))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| NegotiationError::Engine(e.to_string()))?;
        Ok(payload)
    }

    async fn accept_answer(&self, answer: &str) -> Result<(), NegotiationError> {
        let desc: RTCSessionDescription = serde_json::from_str(answer)
            .map_err(|e| NegotiationError::BadDescription(e.to_string()))?;
        crate::debug::log("SDP_ANSWER_FULL", &desc.sdp);

        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::Engine(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| NegotiationError::BadCandidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::BadCandidate(e.to_string()))
    }

    async fn send_frame(&self, frame: &str) -> Result<(), ChannelClosed> {
        let guard = self.channel.read().await;
        let Some(dc) = guard.as_ref() else {
            return Err(ChannelClosed);
        };
        dc.send_text(frame.to_string())
            .await
            .map(|_| ())
            .map_err(|_| ChannelClosed)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Closing connection to {} reported: {}", self.remote_id, e);
        }
    }
}
