// Data channel registry
// Owns the remote-id -> logical-channel mapping. Frames sent before a
// channel opens are queued and flushed on open; inbound frames are decoded
// and dispatched to per-type handlers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::signaling::PeerId;

use super::protocol::AppEnvelope;
use super::transport::PeerLink;

/// Handler for one application message type. Re-registering a type replaces
/// the previous handler wholesale.
pub type MessageHandler = Box<dyn FnMut(&PeerId, Value) + Send>;

struct ChannelSlot {
    link: Arc<dyn PeerLink>,
    open: bool,
    /// Frames queued before the channel opened, flushed in order on open
    pending: Vec<String>,
    ready_fired: bool,
}

pub(crate) struct ChannelRegistry {
    channels: HashMap<PeerId, ChannelSlot>,
    handlers: HashMap<String, MessageHandler>,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            channels: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Record the channel for `remote_id`. The registry does not drive the
    /// channel's lifecycle; the manager detaches it on session cleanup.
    pub(crate) fn attach(&mut self, remote_id: &PeerId, link: Arc<dyn PeerLink>) {
        if self.channels.contains_key(remote_id) {
            warn!("Replacing existing channel for {}", remote_id);
        }
        self.channels.insert(
            remote_id.clone(),
            ChannelSlot {
                link,
                open: false,
                pending: Vec::new(),
                ready_fired: false,
            },
        );
    }

    /// The channel for `remote_id` signalled open. Flushes the pre-open
    /// queue. Returns true the first time this peer's channel opens, so the
    /// caller can fire the once-per-peer ready notification.
    pub(crate) async fn mark_open(&mut self, remote_id: &PeerId) -> bool {
        let Some(slot) = self.channels.get_mut(remote_id) else {
            debug!("Channel open for unknown peer {}; ignoring", remote_id);
            return false;
        };

        slot.open = true;
        let queued = std::mem::take(&mut slot.pending);
        let link = slot.link.clone();
        let first_open = !slot.ready_fired;
        slot.ready_fired = true;

        if !queued.is_empty() {
            debug!("Flushing {} queued frames to {}", queued.len(), remote_id);
        }
        for frame in queued {
            if link.send_frame(&frame).await.is_err() {
                warn!("Dropped queued frame to {} (channel closed)", remote_id);
            }
        }

        first_open
    }

    pub(crate) fn mark_closed(&mut self, remote_id: &PeerId) {
        if let Some(slot) = self.channels.get_mut(remote_id) {
            slot.open = false;
        }
    }

    pub(crate) fn detach(&mut self, remote_id: &PeerId) {
        self.channels.remove(remote_id);
    }

    /// Send one message to a single peer. Returns false when the peer has no
    /// channel (dropped) or the channel is not yet open (queued for the open
    /// flush) — "peer not ready", not an error.
    pub(crate) async fn send_to(&mut self, remote_id: &PeerId, kind: &str, payload: Value) -> bool {
        let frame = match AppEnvelope::new(kind, payload).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {} message: {}", kind, e);
                return false;
            }
        };

        let Some(slot) = self.channels.get_mut(remote_id) else {
            debug!("No channel to {}; dropping {}", remote_id, kind);
            return false;
        };

        if !slot.open {
            slot.pending.push(frame);
            return false;
        }

        match slot.link.send_frame(&frame).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Send to {} failed (channel closed)", remote_id);
                false
            }
        }
    }

    /// Send one message to every open channel. Returns the number of peers
    /// the message was handed to; not-yet-open channels queue it without
    /// counting.
    pub(crate) async fn broadcast(&mut self, kind: &str, payload: Value) -> usize {
        let frame = match AppEnvelope::new(kind, payload).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {} message: {}", kind, e);
                return 0;
            }
        };

        let mut sent = 0;
        for (remote_id, slot) in self.channels.iter_mut() {
            if !slot.open {
                slot.pending.push(frame.clone());
                continue;
            }
            match slot.link.send_frame(&frame).await {
                Ok(()) => sent += 1,
                Err(_) => warn!("Broadcast to {} failed (channel closed)", remote_id),
            }
        }
        sent
    }

    /// Register the handler for one message type. Last registration wins.
    pub(crate) fn on(&mut self, kind: impl Into<String>, handler: MessageHandler) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Decode and dispatch one inbound frame. Malformed frames are logged
    /// and dropped. Returns the decoded message when no handler is
    /// registered for its type, so the caller can surface it as an event.
    pub(crate) fn dispatch(&mut self, from: &PeerId, frame: &str) -> Option<(String, Value)> {
        let envelope = match AppEnvelope::from_frame(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", from, e);
                return None;
            }
        };

        match self.handlers.get_mut(&envelope.kind) {
            Some(handler) => {
                handler(from, envelope.payload);
                None
            }
            None => Some((envelope.kind, envelope.payload)),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.channels.clear();
        self.handlers.clear();
    }
}
