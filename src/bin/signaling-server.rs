// WebRTC Signaling Server
// Relays SDP offers/answers and ICE candidates between peers in named rooms,
// and fans out join/leave presence so browsers can find each other.
//
// Usage: cargo run --bin signaling-server

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use teammesh::signaling::HubMessage;

type PeerId = String;

struct Member {
    name: String,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
}

type Rooms = Arc<RwLock<HashMap<String, HashMap<PeerId, Member>>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let addr = "0.0.0.0:8080";
    let listener = TcpListener::bind(&addr).await?;
    info!("🚀 Signaling server listening on {}", addr);

    let rooms: Rooms = Arc::new(RwLock::new(HashMap::new()));

    while let Ok((stream, addr)) = listener.accept().await {
        let rooms = rooms.clone();
        tokio::spawn(handle_connection(stream, addr, rooms));
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, rooms: Rooms) {
    info!("📥 New connection from {}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    // (room, peer id) once joined
    let mut membership: Option<(String, PeerId)> = None;

    // Spawn task to send messages to this peer
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        if let Message::Text(text) = msg {
            match serde_json::from_str::<HubMessage>(&text) {
                Ok(hub_msg) => {
                    handle_hub_message(hub_msg, &mut membership, &tx, &rooms, addr).await;
                }
                Err(e) => {
                    warn!("Failed to parse message: {}", e);
                    let error_msg = HubMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    };
                    if let Ok(json) = serde_json::to_string(&error_msg) {
                        let _ = tx.send(Message::Text(json));
                    }
                }
            }
        }
    }

    // Clean up on disconnect
    if let Some((room, id)) = membership {
        remove_member(&rooms, &room, &id).await;
        info!("📤 Peer {} disconnected from room {}", id, room);
    }

    send_task.abort();
}

async fn handle_hub_message(
    msg: HubMessage,
    membership: &mut Option<(String, PeerId)>,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    rooms: &Rooms,
    addr: SocketAddr,
) {
    match msg {
        HubMessage::Join { room, peer_id, name } => {
            let mut rooms_lock = rooms.write().await;
            let members = rooms_lock.entry(room.clone()).or_default();

            if members.contains_key(&peer_id) {
                warn!("Peer id {} already present in room {}", peer_id, room);
                let error_msg = HubMessage::Error {
                    message: format!("peer id {} already in use", peer_id),
                };
                if let Ok(json) = serde_json::to_string(&error_msg) {
                    let _ = tx.send(Message::Text(json));
                }
                return;
            }

            info!("✅ Peer {} ({}) joined room {} from {}", peer_id, name, room, addr);

            // Ack first so the client sees JoinOk before any presence
            let ack = HubMessage::JoinOk {
                room: room.clone(),
                peer_id: peer_id.clone(),
            };
            if let Ok(json) = serde_json::to_string(&ack) {
                let _ = tx.send(Message::Text(json));
            }

            // Presence flows both ways: the joiner learns about every
            // existing member, and every member learns about the joiner
            for (id, member) in members.iter() {
                let to_joiner = HubMessage::PeerJoined {
                    name: member.name.clone(),
                    peer_id: id.clone(),
                };
                if let Ok(json) = serde_json::to_string(&to_joiner) {
                    let _ = tx.send(Message::Text(json));
                }

                let to_member = HubMessage::PeerJoined {
                    name: name.clone(),
                    peer_id: peer_id.clone(),
                };
                if let Ok(json) = serde_json::to_string(&to_member) {
                    let _ = member.tx.send(Message::Text(json));
                }
            }

            members.insert(
                peer_id.clone(),
                Member {
                    name,
                    tx: tx.clone(),
                },
            );
            *membership = Some((room, peer_id));
        }

        HubMessage::Leave { room } => {
            if let Some((joined_room, id)) = membership.take() {
                if joined_room == room {
                    remove_member(rooms, &room, &id).await;
                    info!("📤 Peer {} left room {}", id, room);
                } else {
                    *membership = Some((joined_room, id));
                }
            }
        }

        HubMessage::Offer { target, from, sdp } => {
            info!("📨 Relaying offer from {} to {}", from, target);
            relay_message(
                rooms,
                membership,
                &target,
                HubMessage::Offer {
                    target: target.clone(),
                    from,
                    sdp,
                },
            )
            .await;
        }

        HubMessage::Answer { target, from, sdp } => {
            info!("📨 Relaying answer from {} to {}", from, target);
            relay_message(
                rooms,
                membership,
                &target,
                HubMessage::Answer {
                    target: target.clone(),
                    from,
                    sdp,
                },
            )
            .await;
        }

        HubMessage::IceCandidate {
            target,
            from,
            candidate,
        } => {
            info!("🧊 Relaying ICE candidate from {} to {}", from, target);
            relay_message(
                rooms,
                membership,
                &target,
                HubMessage::IceCandidate {
                    target: target.clone(),
                    from,
                    candidate,
                },
            )
            .await;
        }

        _ => {
            warn!("Unhandled message type");
        }
    }
}

async fn relay_message(
    rooms: &Rooms,
    membership: &Option<(String, PeerId)>,
    target: &str,
    msg: HubMessage,
) {
    let Some((room, _)) = membership else {
        warn!("Relay requested before join; dropping");
        return;
    };

    let rooms_lock = rooms.read().await;
    if let Some(member) = rooms_lock.get(room).and_then(|m| m.get(target)) {
        if let Ok(json) = serde_json::to_string(&msg) {
            if member.tx.send(Message::Text(json)).is_err() {
                error!("Failed to send message to peer {}", target);
            }
        }
    } else {
        warn!("Target peer {} not found in room {}", target, room);
    }
}

async fn remove_member(rooms: &Rooms, room: &str, id: &str) {
    let mut rooms_lock = rooms.write().await;
    if let Some(members) = rooms_lock.get_mut(room) {
        if members.remove(id).is_some() {
            let notice = HubMessage::PeerLeft {
                peer_id: id.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&notice) {
                for member in members.values() {
                    let _ = member.tx.send(Message::Text(json.clone()));
                }
            }
        }
        if members.is_empty() {
            rooms_lock.remove(room);
        }
    }
}
