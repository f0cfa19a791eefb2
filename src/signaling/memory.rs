// In-process hub for tests and same-process sessions
// Implements the same adapter contract as the WebSocket client, with rooms
// held in plain maps and events delivered over channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::{HubEvent, PeerId, SignalKind, SignalingEnvelope, SignalingHub, TransportError};

struct Member {
    name: String,
    tx: UnboundedSender<HubEvent>,
}

/// Shared router backing any number of `MemoryHub` clients.
pub struct MemoryHubRouter {
    rooms: Mutex<HashMap<String, HashMap<PeerId, Member>>>,
}

impl MemoryHubRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Create a hub client bound to this router.
    pub fn client(self: &Arc<Self>) -> MemoryHub {
        MemoryHub {
            router: Arc::clone(self),
            joined: Mutex::new(None),
        }
    }

    fn remove_member(&self, room: &str, id: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(members) = rooms.get_mut(room) {
            if members.remove(id).is_some() {
                for member in members.values() {
                    let _ = member.tx.send(HubEvent::PeerLeft { id: id.to_string() });
                }
            }
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

/// One participant's connection to the in-process router.
pub struct MemoryHub {
    router: Arc<MemoryHubRouter>,
    joined: Mutex<Option<(String, PeerId)>>,
}

#[async_trait]
impl SignalingHub for MemoryHub {
    async fn join(
        &self,
        room: &str,
        local_id: &str,
        name: &str,
    ) -> Result<UnboundedReceiver<HubEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut rooms = self.router.rooms.lock().unwrap();
        let members = rooms.entry(room.to_string()).or_default();

        if members.contains_key(local_id) {
            return Err(TransportError::Rejected(format!(
                "peer id {} already present in room {}",
                local_id, room
            )));
        }

        // Presence flows both ways: existing members hear about the joiner,
        // the joiner hears about every existing member.
        for (id, member) in members.iter() {
            let _ = member.tx.send(HubEvent::PeerJoined {
                name: name.to_string(),
                id: local_id.to_string(),
            });
            let _ = tx.send(HubEvent::PeerJoined {
                name: member.name.clone(),
                id: id.clone(),
            });
        }

        members.insert(
            local_id.to_string(),
            Member {
                name: name.to_string(),
                tx,
            },
        );

        *self.joined.lock().unwrap() = Some((room.to_string(), local_id.to_string()));
        debug!("{} joined memory room {}", local_id, room);
        Ok(rx)
    }

    async fn leave(&self, room: &str) {
        let left = self.joined.lock().unwrap().take();
        if let Some((joined_room, id)) = left {
            if joined_room == room {
                self.router.remove_member(room, &id);
                debug!("{} left memory room {}", id, room);
            }
        }
    }

    async fn send_signal(&self, target: &str, kind: SignalKind, payload: String) {
        let joined = self.joined.lock().unwrap().clone();
        let Some((room, local_id)) = joined else {
            warn!("send_signal before join; dropping {:?} to {}", kind, target);
            return;
        };

        let rooms = self.router.rooms.lock().unwrap();
        let Some(member) = rooms.get(&room).and_then(|m| m.get(target)) else {
            warn!("Target peer {} not found in room {}", target, room);
            return;
        };

        let _ = member.tx.send(HubEvent::Signal(SignalingEnvelope {
            from: local_id,
            to: target.to_string(),
            kind,
            payload,
        }));
    }
}
