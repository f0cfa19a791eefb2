// End-to-end mesh tests over the in-process hub and loopback links.
// Exercises the same session plumbing the WebRTC build uses; only the
// engine behind the transport seam differs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use teammesh::mesh::loopback::LoopbackNetwork;
use teammesh::mesh::{ConnectOptions, MeshEvent, MeshSession, PeerRole, PeerState};
use teammesh::signaling::{MemoryHubRouter, SignalKind};

const EVENT_WAIT: Duration = Duration::from_secs(2);

async fn join(
    router: &Arc<MemoryHubRouter>,
    network: &Arc<LoopbackNetwork>,
    room: &str,
    id: &str,
    name: &str,
) -> MeshSession {
    let hub = Arc::new(router.client());
    let connector = Arc::new(network.connector(id));
    let mut options = ConnectOptions::new(room, id, name);
    options.host_grace = Duration::from_millis(50);
    MeshSession::connect(hub, connector, options)
        .await
        .expect("join failed")
}

/// Drain session events until every peer in `expected` has reported ready.
async fn wait_ready(session: &mut MeshSession, expected: &[&str]) {
    let mut remaining: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    while !remaining.is_empty() {
        let event = timeout(EVENT_WAIT, session.recv_event())
            .await
            .expect("timed out waiting for PeerReady")
            .expect("event stream ended");
        if let MeshEvent::PeerReady { id } = event {
            remaining.retain(|r| *r != id);
        }
    }
}

/// Drain session events until an application message arrives.
async fn wait_message(session: &mut MeshSession) -> (String, String, serde_json::Value) {
    loop {
        let event = timeout(EVENT_WAIT, session.recv_event())
            .await
            .expect("timed out waiting for message")
            .expect("event stream ended");
        if let MeshEvent::Message {
            from,
            kind,
            payload,
        } = event
        {
            return (from, kind, payload);
        }
    }
}

#[tokio::test]
async fn test_three_peer_mesh_roles_and_broadcast() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    let mut p1 = join(&router, &network, "R", "1", "one").await;
    let mut p2 = join(&router, &network, "R", "2", "two").await;
    let mut p3 = join(&router, &network, "R", "3", "three").await;

    wait_ready(&mut p1, &["2", "3"]).await;
    wait_ready(&mut p2, &["1", "3"]).await;
    wait_ready(&mut p3, &["1", "2"]).await;

    // Both sides of every pair agree on who initiated: 1 toward 2 and 3,
    // 2 toward 3 only, 3 toward nobody
    let s1 = p1.status().await.unwrap();
    assert!(s1
        .sessions
        .iter()
        .all(|p| p.role == PeerRole::Initiator && p.state == PeerState::Connected));

    let s2 = p2.status().await.unwrap();
    for peer in &s2.sessions {
        let expected = if peer.id == "1" {
            PeerRole::Responder
        } else {
            PeerRole::Initiator
        };
        assert_eq!(peer.role, expected, "wrong role toward {}", peer.id);
    }

    let s3 = p3.status().await.unwrap();
    assert!(s3.sessions.iter().all(|p| p.role == PeerRole::Responder));

    // Broadcast reaches every open channel exactly once
    let count = p1.broadcast("ping", json!(42)).await;
    assert_eq!(count, 2);

    for session in [&mut p2, &mut p3] {
        let (from, kind, payload) = wait_message(session).await;
        assert_eq!(from, "1");
        assert_eq!(kind, "ping");
        assert_eq!(payload, json!(42));
    }

    // No duplicates trailing behind
    assert!(timeout(Duration::from_millis(200), wait_message(&mut p2))
        .await
        .is_err());
}

#[tokio::test]
async fn test_no_retroactive_delivery() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    let mut p1 = join(&router, &network, "R", "1", "one").await;
    let mut p2 = join(&router, &network, "R", "2", "two").await;
    wait_ready(&mut p1, &["2"]).await;
    wait_ready(&mut p2, &["1"]).await;

    assert_eq!(p1.broadcast("ping", json!(1)).await, 1);
    let (_, kind, _) = wait_message(&mut p2).await;
    assert_eq!(kind, "ping");

    // A participant joining after the send never sees the message
    let mut p4 = join(&router, &network, "R", "4", "late").await;
    wait_ready(&mut p4, &["1", "2"]).await;
    assert!(timeout(Duration::from_millis(200), wait_message(&mut p4))
        .await
        .is_err());
}

#[tokio::test]
async fn test_host_election_by_join_order() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    let p1 = join(&router, &network, "arena", "7", "first").await;
    assert!(p1.is_host());

    let p2 = join(&router, &network, "arena", "3", "second").await;
    assert!(!p2.is_host());

    let status = p1.status().await.unwrap();
    assert!(status.is_host);
    let status = p2.status().await.unwrap();
    assert!(!status.is_host);
}

#[tokio::test]
async fn test_send_to_single_peer() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    let mut p1 = join(&router, &network, "R", "1", "one").await;
    let mut p2 = join(&router, &network, "R", "2", "two").await;
    wait_ready(&mut p1, &["2"]).await;
    wait_ready(&mut p2, &["1"]).await;

    assert!(p1.send_to("2", "state", json!({"x": 7})).await);
    let (from, kind, payload) = wait_message(&mut p2).await;
    assert_eq!(from, "1");
    assert_eq!(kind, "state");
    assert_eq!(payload, json!({"x": 7}));

    // Unknown peer is "not ready", not an error
    assert!(!p1.send_to("99", "state", json!(null)).await);
}

#[tokio::test]
async fn test_registered_handler_consumes_messages() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    let mut p1 = join(&router, &network, "R", "1", "one").await;
    let mut p2 = join(&router, &network, "R", "2", "two").await;
    wait_ready(&mut p1, &["2"]).await;
    wait_ready(&mut p2, &["1"]).await;

    let (hit_tx, mut hit_rx) = tokio::sync::mpsc::unbounded_channel();
    p2.on("move", move |from, payload| {
        let _ = hit_tx.send((from.clone(), payload));
    });
    // Give the registration command a chance to land before sending
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(p1.send_to("2", "move", json!({"dx": -1})).await);

    let (from, payload) = timeout(EVENT_WAIT, hit_rx.recv())
        .await
        .expect("handler never ran")
        .unwrap();
    assert_eq!(from, "1");
    assert_eq!(payload, json!({"dx": -1}));

    // Handled types do not double-report as events
    assert!(timeout(Duration::from_millis(200), wait_message(&mut p2))
        .await
        .is_err());
}

#[tokio::test]
async fn test_disconnect_while_negotiating() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    // A hub participant with no mesh behind it: negotiation can never finish
    let ghost = router.client();
    use teammesh::signaling::SignalingHub;
    let _ghost_rx = ghost.join("R", "0", "ghost").await.unwrap();

    let p = join(&router, &network, "R", "5", "real").await;

    // Local id 5 responds to the lower id and waits for an offer that will
    // never arrive
    let status = p.status().await.unwrap();
    assert_eq!(status.total_sessions, 1);
    assert_eq!(status.sessions[0].state, PeerState::Negotiating);
    assert_eq!(status.sessions[0].role, PeerRole::Responder);
    assert!(status.connected_peers.is_empty());

    // Tearing down mid-negotiation must not hang or panic, and must be final
    p.disconnect().await;
    assert!(p.status().await.is_none());
    assert_eq!(p.broadcast("ping", json!(0)).await, 0);

    // Signals arriving after teardown go nowhere
    ghost
        .send_signal("5", SignalKind::Offer, "offer:0->5".to_string())
        .await;
    p.disconnect().await; // idempotent
}

#[tokio::test]
async fn test_negotiation_timeout_reports_peer_left() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    let ghost = router.client();
    use teammesh::signaling::SignalingHub;
    let _ghost_rx = ghost.join("R", "0", "ghost").await.unwrap();

    let hub = Arc::new(router.client());
    let connector = Arc::new(network.connector("5"));
    let mut options = ConnectOptions::new("R", "5", "real");
    options.host_grace = Duration::from_millis(50);
    options.negotiation_timeout = Duration::from_secs(1);
    let mut p = MeshSession::connect(hub, connector, options).await.unwrap();

    // The sweep runs once a second; the stuck session must fail and report
    let event = timeout(Duration::from_secs(5), p.recv_event())
        .await
        .expect("timed out waiting for PeerLeft")
        .expect("event stream ended");
    match event {
        MeshEvent::PeerLeft { id } => assert_eq!(id, "0"),
        other => panic!("unexpected event: {:?}", other),
    }

    let status = p.status().await.unwrap();
    assert_eq!(status.total_sessions, 0);
}

#[tokio::test]
async fn test_peer_disconnect_propagates() {
    let router = MemoryHubRouter::new();
    let network = LoopbackNetwork::new();

    let mut p1 = join(&router, &network, "R", "1", "one").await;
    let mut p2 = join(&router, &network, "R", "2", "two").await;
    wait_ready(&mut p1, &["2"]).await;
    wait_ready(&mut p2, &["1"]).await;

    p2.disconnect().await;

    // Survivor hears about it (room presence or transport teardown,
    // whichever lands first) and drops the session
    let mut saw_left = false;
    for _ in 0..4 {
        match timeout(EVENT_WAIT, p1.recv_event()).await {
            Ok(Some(MeshEvent::PeerLeft { id })) => {
                assert_eq!(id, "2");
                saw_left = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_left, "never saw PeerLeft for 2");

    let status = p1.status().await.unwrap();
    assert_eq!(status.total_sessions, 0);
    assert_eq!(p1.broadcast("ping", json!(0)).await, 0);
}
