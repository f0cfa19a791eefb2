// WebSocket client for the relay hub
// Connects, joins a room, and turns inbound wire messages into HubEvents.
// Outbound signals are fire-and-forget relays.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use super::{HubEvent, HubMessage, SignalKind, SignalingEnvelope, SignalingHub, TransportError};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Hub adapter over a hosted WebSocket relay.
pub struct WsHub {
    url: String,
    sink: Mutex<Option<WsSink>>,
    local_id: Mutex<Option<String>>,
}

impl WsHub {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink: Mutex::new(None),
            local_id: Mutex::new(None),
        }
    }

    async fn send_wire(&self, msg: &HubMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg)
            .map_err(|e| TransportError::Connect(format!("encode failed: {}", e)))?;
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink
                .send(Message::Text(json))
                .await
                .map_err(|e| TransportError::Connect(e.to_string())),
            None => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl SignalingHub for WsHub {
    async fn join(
        &self,
        room: &str,
        local_id: &str,
        name: &str,
    ) -> Result<UnboundedReceiver<HubEvent>, TransportError> {
        info!("Connecting to signaling hub: {}", self.url);
        crate::debug::log("SIGNALING", &format!("Connecting to hub: {}", self.url));

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, mut stream) = ws_stream.split();

        *self.sink.lock().await = Some(sink);
        *self.local_id.lock().await = Some(local_id.to_string());

        self.send_wire(&HubMessage::Join {
            room: room.to_string(),
            peer_id: local_id.to_string(),
            name: name.to_string(),
        })
        .await?;

        // Wait for the join acknowledgement before exposing the event stream.
        // Presence messages for peers already in the room follow the ack.
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<HubMessage>(&text) {
                        Ok(HubMessage::JoinOk { room, .. }) => {
                            info!("Joined room {} as {}", room, local_id);
                            crate::debug::log("SIGNALING", &format!("Joined room {}", room));
                            break;
                        }
                        Ok(HubMessage::Error { message }) => {
                            return Err(TransportError::Rejected(message));
                        }
                        Ok(other) => {
                            debug!("Ignoring pre-join message: {:?}", other);
                        }
                        Err(e) => {
                            warn!("Unparseable hub message during join: {}", e);
                        }
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                None => return Err(TransportError::Closed),
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Reader task: wire messages in, hub events out. Ends when the
        // socket closes; the mesh keeps running on established channels.
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let msg = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Hub socket error: {}", e);
                        break;
                    }
                };

                let event = match serde_json::from_str::<HubMessage>(&msg) {
                    Ok(HubMessage::PeerJoined { name, peer_id }) => {
                        HubEvent::PeerJoined { name, id: peer_id }
                    }
                    Ok(HubMessage::PeerLeft { peer_id }) => HubEvent::PeerLeft { id: peer_id },
                    Ok(HubMessage::Offer { target, from, sdp }) => {
                        HubEvent::Signal(SignalingEnvelope {
                            from,
                            to: target,
                            kind: SignalKind::Offer,
                            payload: sdp,
                        })
                    }
                    Ok(HubMessage::Answer { target, from, sdp }) => {
                        HubEvent::Signal(SignalingEnvelope {
                            from,
                            to: target,
                            kind: SignalKind::Answer,
                            payload: sdp,
                        })
                    }
                    Ok(HubMessage::IceCandidate {
                        target,
                        from,
                        candidate,
                    }) => HubEvent::Signal(SignalingEnvelope {
                        from,
                        to: target,
                        kind: SignalKind::IceCandidate,
                        payload: candidate,
                    }),
                    Ok(HubMessage::Error { message }) => {
                        warn!("Hub error: {}", message);
                        continue;
                    }
                    Ok(other) => {
                        debug!("Ignoring hub message: {:?}", other);
                        continue;
                    }
                    Err(e) => {
                        warn!("Unparseable hub message: {}", e);
                        continue;
                    }
                };

                if event_tx.send(event).is_err() {
                    // Session loop is gone; stop reading.
                    break;
                }
            }
            debug!("Hub reader task ended");
        });

        Ok(event_rx)
    }

    async fn leave(&self, room: &str) {
        let _ = self
            .send_wire(&HubMessage::Leave {
                room: room.to_string(),
            })
            .await;

        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.close().await {
                debug!("Hub close failed (already gone): {}", e);
            }
        }
        crate::debug::log("SIGNALING", &format!("Left room {}", room));
    }

    async fn send_signal(&self, target: &str, kind: SignalKind, payload: String) {
        let from = match self.local_id.lock().await.clone() {
            Some(id) => id,
            None => {
                warn!("send_signal before join; dropping {:?} to {}", kind, target);
                return;
            }
        };

        let msg = HubMessage::signal(target, &from, kind, payload);
        if let Err(e) = self.send_wire(&msg).await {
            // The remote may have left or the hub may be down; negotiation
            // for that peer will time out on its own.
            warn!("Failed to relay {:?} to {}: {}", kind, target, e);
            crate::debug::log(
                "SIGNALING",
                &format!("Relay of {:?} to {} failed: {}", kind, target, e),
            );
        }
    }
}
