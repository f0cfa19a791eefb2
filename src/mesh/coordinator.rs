// Session coordinator
// The single entry/exit point for the game layer: join a room, probe for
// host status, then run the event loop that owns all mesh state. The loop
// is the only place sessions and channels are touched, so no locking is
// needed; callers talk to it over channels.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::signaling::{HubEvent, PeerId, SignalingHub, TransportError, WsHub};

use super::manager::PeerManager;
use super::peer::{PeerRole, PeerState};
use super::registry::{ChannelRegistry, MessageHandler};
use super::transport::{LinkEvent, PeerConnector};
use super::webrtc::WebRtcConnector;
use super::MeshEvent;

/// Connection parameters for one session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub room: String,
    pub local_id: String,
    pub display_name: String,
    /// How long to wait after joining for existing-peer notifications
    /// before declaring ourselves host
    pub host_grace: Duration,
    /// A session stuck negotiating longer than this is failed
    pub negotiation_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(
        room: impl Into<String>,
        local_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            room: room.into(),
            local_id: local_id.into(),
            display_name: display_name.into(),
            host_grace: Duration::from_millis(200),
            negotiation_timeout: Duration::from_secs(20),
        }
    }

    pub fn from_config(
        config: &Config,
        room: impl Into<String>,
        local_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let mut options = Self::new(room, local_id, display_name);
        options.host_grace = Duration::from_millis(config.network.host_grace_ms);
        options.negotiation_timeout = Duration::from_secs(config.network.negotiation_timeout_secs);
        options
    }
}

/// Read-only diagnostic snapshot of the session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub local_id: PeerId,
    pub room: String,
    pub is_host: bool,
    pub connected_peers: Vec<PeerId>,
    pub total_sessions: usize,
    pub sessions: Vec<PeerStatus>,
}

#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub id: PeerId,
    pub state: PeerState,
    pub role: PeerRole,
}

enum Command {
    SendTo {
        to: PeerId,
        kind: String,
        payload: Value,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        kind: String,
        payload: Value,
        reply: oneshot::Sender<usize>,
    },
    On {
        kind: String,
        handler: MessageHandler,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// A live mesh session. Dropping the handle (or calling `disconnect`) tears
/// the session down.
pub struct MeshSession {
    local_id: PeerId,
    room: String,
    is_host: bool,
    cmd_tx: UnboundedSender<Command>,
    events: UnboundedReceiver<MeshEvent>,
}

impl MeshSession {
    /// Join `room` and start the mesh. Returns once host status is known;
    /// peer connections keep negotiating in the background. Fails only on
    /// signaling-level join errors — individual peers failing later never
    /// fails the session.
    ///
    /// Host status is a grace-window probe: if nobody else announces
    /// themselves within `host_grace`, we are the host. Two participants
    /// joining within the same window can both elect themselves host; the
    /// hosted hub makes this rare but nothing here rules it out.
    pub async fn connect(
        hub: Arc<dyn SignalingHub>,
        connector: Arc<dyn PeerConnector>,
        options: ConnectOptions,
    ) -> Result<MeshSession, TransportError> {
        let ConnectOptions {
            room,
            local_id,
            display_name,
            host_grace,
            negotiation_timeout,
        } = options;

        let mut hub_rx = hub.join(&room, &local_id, &display_name).await?;

        // Probe for existing participants before claiming host status.
        // Nothing seen during the window is lost: events are buffered and
        // replayed into the loop below.
        let deadline = Instant::now() + host_grace;
        let mut buffered: Vec<HubEvent> = Vec::new();
        let mut saw_existing_peer = false;
        loop {
            match tokio::time::timeout_at(deadline, hub_rx.recv()).await {
                Ok(Some(event)) => {
                    if let HubEvent::PeerJoined { id, .. } = &event {
                        if *id != local_id {
                            saw_existing_peer = true;
                        }
                    }
                    buffered.push(event);
                }
                Ok(None) => break,
                Err(_) => break, // grace window elapsed
            }
        }

        let is_host = !saw_existing_peer;
        info!(
            "Joined room {} as {} ({})",
            room,
            local_id,
            if is_host { "HOST" } else { "CLIENT" }
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let manager = PeerManager::new(
            local_id.clone(),
            hub.clone(),
            connector,
            link_tx,
            event_tx.clone(),
            negotiation_timeout,
        );

        tokio::spawn(run_session_loop(SessionLoop {
            room: room.clone(),
            local_id: local_id.clone(),
            is_host,
            hub,
            manager,
            registry: ChannelRegistry::new(),
            events_out: event_tx,
            hub_rx,
            link_rx,
            cmd_rx,
            buffered,
        }));

        Ok(MeshSession {
            local_id,
            room,
            is_host,
            cmd_tx,
            events: event_rx,
        })
    }

    /// Production wiring: WebSocket hub + WebRTC links, parameters from the
    /// loaded config.
    pub async fn connect_ws(
        config: &Config,
        room: impl Into<String>,
        local_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<MeshSession, TransportError> {
        crate::debug::init(config.network.debug_log).ok();

        let hub = Arc::new(WsHub::new(config.network.signaling_server.clone()));
        let connector = Arc::new(WebRtcConnector::new(
            config.ice.stun_servers.clone(),
            config.channel.clone(),
        ));
        let options = ConnectOptions::from_config(config, room, local_id, display_name);
        Self::connect(hub, connector, options).await
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Host status decided at join time. See `connect` for the caveat.
    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Send one message to a single peer. False means "peer not ready" (no
    /// channel, or channel not open yet) — not an error.
    pub async fn send_to(&self, to: impl Into<PeerId>, kind: impl Into<String>, payload: Value) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self.cmd_tx.send(Command::SendTo {
            to: to.into(),
            kind: kind.into(),
            payload,
            reply,
        });
        if sent.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Send one message to every peer whose channel is open. Returns how
    /// many peers it was handed to; peers joining later never see it.
    pub async fn broadcast(&self, kind: impl Into<String>, payload: Value) -> usize {
        let (reply, rx) = oneshot::channel();
        let sent = self.cmd_tx.send(Command::Broadcast {
            kind: kind.into(),
            payload,
            reply,
        });
        if sent.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Register the handler for one message type. Re-registering a type
    /// replaces the previous handler.
    pub fn on(&self, kind: impl Into<String>, handler: impl FnMut(&PeerId, Value) + Send + 'static) {
        let _ = self.cmd_tx.send(Command::On {
            kind: kind.into(),
            handler: Box::new(handler),
        });
    }

    /// Diagnostic snapshot. No side effects. None once disconnected.
    pub async fn status(&self) -> Option<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Status { reply }).ok()?;
        rx.await.ok()
    }

    /// Tear the session down: close every peer, leave the room, stop the
    /// loop. Idempotent — calling it twice is fine.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait for the next session event. None after disconnect.
    pub async fn recv_event(&mut self) -> Option<MeshEvent> {
        self.events.recv().await
    }

    /// Non-blocking poll for a session event, for frame-loop callers.
    pub fn try_recv_event(&mut self) -> Option<MeshEvent> {
        self.events.try_recv().ok()
    }
}

struct SessionLoop {
    room: String,
    local_id: PeerId,
    is_host: bool,
    hub: Arc<dyn SignalingHub>,
    manager: PeerManager,
    registry: ChannelRegistry,
    events_out: UnboundedSender<MeshEvent>,
    hub_rx: UnboundedReceiver<HubEvent>,
    link_rx: UnboundedReceiver<(PeerId, LinkEvent)>,
    cmd_rx: UnboundedReceiver<Command>,
    buffered: Vec<HubEvent>,
}

async fn run_session_loop(mut ctx: SessionLoop) {
    // Events that arrived during the host-election grace window
    for event in std::mem::take(&mut ctx.buffered) {
        handle_hub_event(&mut ctx.manager, &mut ctx.registry, event).await;
    }

    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut hub_open = true;

    loop {
        tokio::select! {
            maybe_event = ctx.hub_rx.recv(), if hub_open => {
                match maybe_event {
                    Some(event) => {
                        handle_hub_event(&mut ctx.manager, &mut ctx.registry, event).await;
                    }
                    None => {
                        // Hub gone; established channels keep running
                        warn!("Signaling stream ended; no new peers can join");
                        hub_open = false;
                    }
                }
            }

            Some((id, event)) = ctx.link_rx.recv() => {
                handle_link_event(&mut ctx, &id, event).await;
            }

            maybe_cmd = ctx.cmd_rx.recv() => {
                match maybe_cmd {
                    Some(Command::SendTo { to, kind, payload, reply }) => {
                        let ok = ctx.registry.send_to(&to, &kind, payload).await;
                        let _ = reply.send(ok);
                    }
                    Some(Command::Broadcast { kind, payload, reply }) => {
                        let count = ctx.registry.broadcast(&kind, payload).await;
                        let _ = reply.send(count);
                    }
                    Some(Command::On { kind, handler }) => {
                        ctx.registry.on(kind, handler);
                    }
                    Some(Command::Status { reply }) => {
                        let _ = reply.send(build_status(&ctx));
                    }
                    Some(Command::Disconnect { reply }) => {
                        shutdown(&mut ctx).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        // Handle dropped without an explicit disconnect
                        shutdown(&mut ctx).await;
                        break;
                    }
                }
            }

            _ = sweep.tick() => {
                ctx.manager.sweep_timeouts(&mut ctx.registry).await;
            }
        }
    }
    debug!("Session loop for room {} ended", ctx.room);
}

async fn handle_hub_event(
    manager: &mut PeerManager,
    registry: &mut ChannelRegistry,
    event: HubEvent,
) {
    match event {
        HubEvent::PeerJoined { name, id } => {
            manager.handle_peer_joined(&name, &id, registry).await;
        }
        HubEvent::PeerLeft { id } => {
            manager.handle_peer_left(&id, registry).await;
        }
        HubEvent::Signal(envelope) => {
            manager.handle_signal(envelope, registry).await;
        }
    }
}

async fn handle_link_event(ctx: &mut SessionLoop, id: &PeerId, event: LinkEvent) {
    match event {
        LinkEvent::LocalCandidate(candidate) => {
            ctx.hub
                .send_signal(id, crate::signaling::SignalKind::IceCandidate, candidate)
                .await;
        }
        LinkEvent::Connected => {
            ctx.manager.handle_link_connected(id);
        }
        LinkEvent::Disconnected => {
            ctx.manager.handle_link_disconnected(id, &mut ctx.registry).await;
        }
        LinkEvent::ChannelOpen => {
            if ctx.registry.mark_open(id).await {
                let _ = ctx.events_out.send(MeshEvent::PeerReady { id: id.clone() });
            }
        }
        LinkEvent::ChannelMessage(frame) => {
            if let Some((kind, payload)) = ctx.registry.dispatch(id, &frame) {
                let _ = ctx.events_out.send(MeshEvent::Message {
                    from: id.clone(),
                    kind,
                    payload,
                });
            }
        }
        LinkEvent::ChannelClosed => {
            ctx.registry.mark_closed(id);
        }
    }
}

fn build_status(ctx: &SessionLoop) -> SessionStatus {
    let sessions: Vec<PeerStatus> = ctx
        .manager
        .sessions()
        .into_iter()
        .map(|(id, state, role)| PeerStatus { id, state, role })
        .collect();

    SessionStatus {
        local_id: ctx.local_id.clone(),
        room: ctx.room.clone(),
        is_host: ctx.is_host,
        connected_peers: ctx.manager.connected_peer_ids(),
        total_sessions: sessions.len(),
        sessions,
    }
}

async fn shutdown(ctx: &mut SessionLoop) {
    info!("Disconnecting from room {}", ctx.room);
    ctx.manager.close_all(&mut ctx.registry).await;
    ctx.hub.leave(&ctx.room).await;
}
