//! Drill Integration Tests
//!
//! Coordinator (server, touch consumer, orchestrator, memory store) on a
//! loopback port with stations talking the real heartbeat protocol.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use agility_mesh::config::{defaults, DrillConfig, LinkConfig, MeshConfig};
use agility_mesh::detection::{SimulatedSensor, TapTrigger};
use agility_mesh::feedback::{FeedbackController, LogAudio, LogIndicator};
use agility_mesh::link::{HeartbeatClient, NodeLink};
use agility_mesh::orchestrator::{run_touch_consumer, Orchestrator};
use agility_mesh::protocol::HeartbeatRequest;
use agility_mesh::registry::NodeRegistry;
use agility_mesh::server::HeartbeatServer;
use agility_mesh::store::{MemoryRunStore, NewSession, RunRecord, RunStore};
use agility_mesh::types::{FeedbackState, NodeId, RunStatus, TouchEvent};

struct Coordinator {
    addr: String,
    registry: Arc<NodeRegistry>,
    orchestrator: Orchestrator,
    store: Arc<MemoryRunStore>,
    cancel: CancellationToken,
}

/// A running station: its light and the hand that taps it.
struct Station {
    node_id: NodeId,
    feedback: Arc<FeedbackController>,
    trigger: TapTrigger,
}

fn drill_config() -> DrillConfig {
    DrillConfig {
        countdown_ticks: 1,
        countdown_tick_ms: 100,
        target_count: 5,
        touch_timeout_ms: None,
        inter_run_pause_ms: 200,
    }
}

async fn start_coordinator() -> Coordinator {
    start_coordinator_with(Duration::from_secs(2), drill_config()).await
}

async fn start_coordinator_with(offline_after: Duration, drill: DrillConfig) -> Coordinator {
    let registry = Arc::new(NodeRegistry::new(offline_after));
    let store = Arc::new(MemoryRunStore::new());
    let orchestrator = Orchestrator::new(
        drill,
        "coordinator",
        Arc::clone(&registry),
        store.clone(),
        Arc::new(LogAudio::new("coordinator")),
    );
    let (touch_tx, touch_rx) = mpsc::channel(64);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    tokio::spawn(HeartbeatServer::new(Arc::clone(&registry), touch_tx).run(listener, cancel.clone()));
    tokio::spawn(run_touch_consumer(orchestrator.clone(), touch_rx, cancel.clone()));
    Coordinator {
        addr,
        registry,
        orchestrator,
        store,
        cancel,
    }
}

fn targets() -> Vec<NodeId> {
    (1..=5).map(|i| format!("cone-{i}")).collect()
}

async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

fn armed(orchestrator: &Orchestrator) -> Option<NodeId> {
    orchestrator.snapshot().and_then(|s| s.run).and_then(|r| r.armed)
}

fn touches(orchestrator: &Orchestrator) -> u32 {
    orchestrator
        .snapshot()
        .and_then(|s| s.run)
        .map_or(0, |r| r.touches)
}

/// Detection engine on a simulated sensor, feedback light and node link for
/// every target, all connected.
async fn start_stations(coordinator: &Coordinator, config: &MeshConfig) -> Vec<Station> {
    let mut stations = Vec::new();
    for (i, node_id) in targets().into_iter().enumerate() {
        let sensor = SimulatedSensor::new(0.01, Some(i as u64 + 1));
        let trigger = sensor.trigger();
        let link = NodeLink::start_station(
            config,
            &node_id,
            &coordinator.addr,
            sensor,
            LogIndicator::new(node_id.clone()),
            Arc::new(LogAudio::new(node_id.clone())),
        )
        .await
        .unwrap();
        assert!(link.detection().is_some(), "{node_id} should calibrate at start");
        stations.push(Station {
            node_id,
            feedback: Arc::clone(link.feedback()),
            trigger,
        });
        tokio::spawn(link.run(coordinator.cancel.clone()));
    }

    let registry = Arc::clone(&coordinator.registry);
    assert!(wait_until(|| targets().iter().all(|id| registry.is_online(id)), Duration::from_secs(5)).await);
    stations
}

/// Athlete: taps each light once per activation.
///
/// Returns, for every target it tapped while armed, how long after arming
/// the light came on.
fn spawn_athlete(
    orchestrator: Orchestrator,
    stations: Vec<Station>,
    cancel: CancellationToken,
) -> JoinHandle<Vec<(NodeId, Duration)>> {
    tokio::spawn(async move {
        let mut tapped = vec![false; stations.len()];
        let mut armed_since: Option<(NodeId, Instant)> = None;
        let mut lags = Vec::new();
        while !cancel.is_cancelled() {
            if let Some(node) = armed(&orchestrator) {
                if armed_since.as_ref().map_or(true, |(prev, _)| *prev != node) {
                    armed_since = Some((node, Instant::now()));
                }
            }
            for (i, station) in stations.iter().enumerate() {
                if station.feedback.get_state() == FeedbackState::Active {
                    if !tapped[i] {
                        tapped[i] = true;
                        if let Some((node, since)) = &armed_since {
                            if *node == station.node_id {
                                lags.push((node.clone(), since.elapsed()));
                            }
                        }
                        station.trigger.tap(0.9);
                    }
                } else {
                    tapped[i] = false;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        lags
    })
}

/// Full stack: detection engines on simulated sensors, node links, feedback
/// lights, and an athlete tapping whichever light turns active.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reaction_drill_completes_end_to_end() {
    let coordinator = start_coordinator().await;
    let calibration_dir = tempfile::tempdir().unwrap();

    let mut config = MeshConfig::default();
    config.link.heartbeat_interval_ms = 100;
    config.link.retry_delay_ms = 100;
    config.detection.rest_duration_ms = 600;
    config.detection.calibration_dir = calibration_dir.path().to_path_buf();
    config.drill = drill_config();

    let stations = start_stations(&coordinator, &config).await;
    spawn_athlete(coordinator.orchestrator.clone(), stations, coordinator.cancel.clone());

    let new = NewSession::reaction("Reaction", &targets(), &["Ana".to_string()]);
    let run_id = new.runs[0].id.clone();
    let session_id = new.session.id.clone();
    coordinator.store.put_new_session(new);
    coordinator.orchestrator.start_session_by_id(&session_id).await.unwrap();

    let orchestrator = coordinator.orchestrator.clone();
    assert!(
        wait_until(|| !orchestrator.is_active(), Duration::from_secs(20)).await,
        "session should finish"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let run = coordinator.store.fetch_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let segments = coordinator.store.segments_for_run(&run_id).await.unwrap();
    assert_eq!(segments.iter().map(|s| s.ordinal).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    let mut nodes: Vec<NodeId> = segments.iter().map(|s| s.node_id.clone()).collect();
    nodes.sort();
    assert_eq!(nodes, targets());
    assert!(segments.windows(2).all(|w| w[0].split_ms <= w[1].split_ms));
    assert_eq!(run.elapsed_ms, segments.last().map(|s| s.split_ms));

    for id in targets() {
        let desired = coordinator.registry.get(&id).and_then(|n| n.desired_feedback).map(|f| f.state);
        assert_eq!(desired, Some(FeedbackState::Standby));
    }
    coordinator.cancel.cancel();
}

/// Stock link timing: periodic heartbeats every 3 s, yet each armed target
/// lights within a second and splits do not absorb the heartbeat period.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn armed_target_lights_promptly_at_default_heartbeat() {
    let mut drill = drill_config();
    // Long enough for every station to hear of the session before "go"
    drill.countdown_ticks = 4;
    drill.countdown_tick_ms = 1_000;
    let coordinator = start_coordinator_with(Duration::from_millis(defaults::OFFLINE_AFTER_MS), drill).await;
    let calibration_dir = tempfile::tempdir().unwrap();

    let mut config = MeshConfig::default();
    assert_eq!(config.link.heartbeat_interval_ms, defaults::HEARTBEAT_INTERVAL_MS);
    config.detection.rest_duration_ms = 600;
    config.detection.calibration_dir = calibration_dir.path().to_path_buf();

    let stations = start_stations(&coordinator, &config).await;
    let athlete = spawn_athlete(coordinator.orchestrator.clone(), stations, coordinator.cancel.clone());

    coordinator
        .orchestrator
        .start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")])
        .unwrap();
    let orchestrator = coordinator.orchestrator.clone();
    assert!(
        wait_until(|| !orchestrator.is_active(), Duration::from_secs(30)).await,
        "session should finish"
    );
    coordinator.cancel.cancel();
    let lags = athlete.await.unwrap();

    assert_eq!(lags.len(), 5, "every target lit while armed: {lags:?}");
    for (node, lag) in &lags {
        assert!(*lag < Duration::from_secs(1), "{node} lit {lag:?} after being armed");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let segments = coordinator.store.segments_for_run("r1").await.unwrap();
    assert_eq!(segments.len(), 5);
    let mut previous = 0;
    for segment in &segments {
        let reaction = segment.split_ms - previous;
        assert!(reaction < 1_000, "target {} took {reaction} ms", segment.ordinal);
        previous = segment.split_ms;
    }
    let run = coordinator.store.fetch_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.elapsed_ms, Some(previous));
}

/// Bare heartbeat clients stand in for stations so the order of touches is
/// under the test's control.
#[tokio::test]
async fn out_of_order_touch_is_rejected_over_the_wire() {
    let coordinator = start_coordinator().await;
    let mut clients = Vec::new();
    for id in targets() {
        let mut client = HeartbeatClient::new(coordinator.addr.clone(), &LinkConfig::default());
        client.connect().await.unwrap();
        client.exchange(&HeartbeatRequest::new(id.clone())).await.unwrap();
        clients.push((id, client));
    }

    coordinator
        .orchestrator
        .start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")])
        .unwrap();
    let orchestrator = coordinator.orchestrator.clone();
    assert!(wait_until(|| armed(&orchestrator).is_some(), Duration::from_secs(2)).await);
    let target = armed(&orchestrator).unwrap();

    // The armed node's acknowledgement carries the activation
    let (_, armed_client) = clients.iter_mut().find(|(id, _)| *id == target).unwrap();
    let ack = armed_client.exchange(&HeartbeatRequest::new(target.clone())).await.unwrap();
    assert_eq!(ack.feedback.map(|f| f.state), Some(FeedbackState::Active));
    assert!(ack.assignment.is_some());

    // A different node reports a touch: rejected, nothing advances
    let (wrong_id, wrong_client) = clients.iter_mut().find(|(id, _)| *id != target).unwrap();
    let mut request = HeartbeatRequest::new(wrong_id.clone());
    request.touches = vec![TouchEvent::new(wrong_id.clone(), Utc::now(), 0.8)];
    wrong_client.exchange(&request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(touches(&orchestrator), 0);
    assert_eq!(armed(&orchestrator).as_ref(), Some(&target));

    // The armed node's touch, reported twice, counts once
    let (_, armed_client) = clients.iter_mut().find(|(id, _)| *id == target).unwrap();
    let mut request = HeartbeatRequest::new(target.clone());
    request.touches = vec![TouchEvent::new(target.clone(), Utc::now(), 0.8)];
    armed_client.exchange(&request).await.unwrap();
    armed_client.exchange(&request).await.unwrap();
    assert!(wait_until(|| touches(&orchestrator) == 1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(touches(&orchestrator), 1);
    assert_ne!(armed(&orchestrator).as_ref(), Some(&target));

    coordinator.orchestrator.stop();
    // The stopped run is written from a spawned task
    tokio::time::sleep(Duration::from_millis(100)).await;
    let run = coordinator.store.fetch_run("r1").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure.as_deref(), Some("stopped"));
    coordinator.cancel.cancel();
}
