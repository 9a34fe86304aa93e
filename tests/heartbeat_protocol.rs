//! Heartbeat Protocol Integration Tests
//!
//! A real `HeartbeatServer` on a loopback port talking to `HeartbeatClient`s
//! and raw sockets.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use agility_mesh::config::LinkConfig;
use agility_mesh::link::HeartbeatClient;
use agility_mesh::protocol::HeartbeatRequest;
use agility_mesh::registry::NodeRegistry;
use agility_mesh::server::HeartbeatServer;
use agility_mesh::types::{ActionKind, AudioClip, Command, FeedbackState, NodeStatus, TouchEvent};

const WINDOW: Duration = Duration::from_secs(10);

struct Harness {
    addr: String,
    registry: Arc<NodeRegistry>,
    touches: mpsc::Receiver<TouchEvent>,
    cancel: CancellationToken,
}

async fn start_server() -> Harness {
    let registry = Arc::new(NodeRegistry::new(WINDOW));
    let (tx, rx) = mpsc::channel(32);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    tokio::spawn(HeartbeatServer::new(Arc::clone(&registry), tx).run(listener, cancel.clone()));
    Harness {
        addr,
        registry,
        touches: rx,
        cancel,
    }
}

async fn client(addr: &str) -> HeartbeatClient {
    let mut client = HeartbeatClient::new(addr, &LinkConfig::default());
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn commands_are_delivered_once_and_intent_repeats() {
    let harness = start_server().await;
    harness.registry.send_to_node("cone-2", Command::PlayAudio { clip: AudioClip::Beep });
    harness.registry.set_feedback_state("cone-2", FeedbackState::Active);
    let assignment_id = harness.registry.assign_action("cone-2", ActionKind::Touch);

    let mut client = client(&harness.addr).await;
    let first = client.exchange(&HeartbeatRequest::new("cone-2")).await.unwrap();
    assert!(first.ack);
    assert_eq!(first.commands, vec![Command::PlayAudio { clip: AudioClip::Beep }]);
    assert_eq!(first.assignment.map(|a| a.id), Some(assignment_id));
    assert_eq!(first.feedback.map(|f| f.state), Some(FeedbackState::Active));

    let second = client.exchange(&HeartbeatRequest::new("cone-2")).await.unwrap();
    assert!(second.commands.is_empty());
    assert_eq!(second.assignment, first.assignment);
    assert_eq!(second.feedback, first.feedback);

    let node = harness.registry.get("cone-2").unwrap();
    assert!(node.online);
    assert_eq!(node.status, NodeStatus::Ready);
    harness.cancel.cancel();
}

#[tokio::test]
async fn retried_touch_is_forwarded_once() {
    let mut harness = start_server().await;
    let mut request = HeartbeatRequest::new("cone-4");
    request.touches = vec![TouchEvent::new("cone-4", Utc::now(), 0.8)];

    // Same touch on two connections, as after a lost acknowledgement
    let mut first = client(&harness.addr).await;
    first.exchange(&request).await.unwrap();
    assert!(first.is_connected());
    first.disconnect().await;
    assert!(!first.is_connected());
    let mut second = client(&harness.addr).await;
    second.exchange(&request).await.unwrap();

    let touch = tokio::time::timeout(Duration::from_secs(2), harness.touches.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(touch.node_id, "cone-4");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), harness.touches.recv())
            .await
            .is_err(),
        "a redelivered touch must not be forwarded again"
    );
    harness.cancel.cancel();
}

#[tokio::test]
async fn test_mode_touches_are_not_forwarded() {
    let mut harness = start_server().await;
    let mut touch = TouchEvent::new("cone-1", Utc::now(), 0.8);
    touch.test_mode = true;
    let mut request = HeartbeatRequest::new("cone-1");
    request.touches = vec![touch];

    let mut client = client(&harness.addr).await;
    client.exchange(&request).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), harness.touches.recv())
            .await
            .is_err()
    );
    harness.cancel.cancel();
}

#[tokio::test]
async fn malformed_line_closes_connection() {
    let harness = start_server().await;
    let stream = TcpStream::connect(&harness.addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"this is not json\n").await.unwrap();

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0, "server should close without replying");
    harness.cancel.cancel();
}

#[tokio::test]
async fn oversized_line_closes_connection() {
    let harness = start_server().await;
    let stream = TcpStream::connect(&harness.addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let huge = vec![b'x'; 70 * 1024];
    // The server may close before the whole line is written
    let _ = write_half.write_all(&huge).await;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    harness.cancel.cancel();
}

#[tokio::test]
async fn silent_node_goes_offline_and_rejoins() {
    let harness = start_server().await;
    let mut client = client(&harness.addr).await;
    client.exchange(&HeartbeatRequest::new("cone-5")).await.unwrap();
    assert!(harness.registry.is_online("cone-5"));

    // Just inside the window nothing changes
    assert!(harness.registry.sweep(Instant::now() + WINDOW - Duration::from_millis(100)).is_empty());
    assert_eq!(harness.registry.sweep(Instant::now() + WINDOW + Duration::from_secs(1)), vec!["cone-5".to_string()]);
    assert!(!harness.registry.is_online("cone-5"));

    client.exchange(&HeartbeatRequest::new("cone-5")).await.unwrap();
    assert!(harness.registry.is_online("cone-5"));
    harness.cancel.cancel();
}
