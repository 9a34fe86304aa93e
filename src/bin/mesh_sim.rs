//! Mesh Simulation - one coordinator, its co-located station and five target
//! stations in a single process, driven by a virtual athlete
//!
//! Every station runs the real detection engine on a simulated accelerometer
//! and talks to the coordinator over loopback TCP. The athlete watches the
//! target lights and taps whichever one turns active after a random reaction
//! delay.
//!
//! ```bash
//! cargo run --bin mesh-sim -- --athletes Ana,Ben,Cleo
//! RUST_LOG=debug cargo run --bin mesh-sim -- --seed 7
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agility_mesh::config::{defaults, MeshConfig};
use agility_mesh::detection::{SimulatedSensor, TapTrigger};
use agility_mesh::feedback::{FeedbackController, LogAudio, LogIndicator};
use agility_mesh::link::NodeLink;
use agility_mesh::orchestrator::{run_touch_consumer, Orchestrator};
use agility_mesh::registry::{run_liveness_sweep, NodeRegistry};
use agility_mesh::server::HeartbeatServer;
use agility_mesh::store::{MemoryRunStore, NewSession, RunStore};
use agility_mesh::types::{FeedbackState, NodeId};

/// Peak of a simulated athlete tap above rest (g)
const TAP_PEAK_G: f64 = 0.9;

/// Per-axis accelerometer noise of every simulated station (g)
const SENSOR_NOISE_G: f64 = 0.01;

/// How often the athlete looks at the lights
const WATCH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "mesh-sim")]
#[command(about = "Run a reaction drill on a simulated training mesh")]
struct SimArgs {
    /// Athletes in run order, comma separated
    #[arg(long, value_delimiter = ',', default_value = "Ana,Ben")]
    athletes: Vec<String>,

    /// Number of target stations
    #[arg(long, default_value_t = defaults::DRILL_TARGET_COUNT)]
    targets: usize,

    /// Mean athlete reaction time (ms)
    #[arg(long, default_value_t = 450.0)]
    reaction_ms: f64,

    /// Reaction time standard deviation (ms)
    #[arg(long, default_value_t = 120.0)]
    reaction_sd_ms: f64,

    /// RNG seed for sensors and reactions
    #[arg(long)]
    seed: Option<u64>,

    /// Give up if the session has not finished after this many seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

/// Mesh settings tuned for a quick in-process run.
fn sim_config(calibration_dir: PathBuf, targets: usize) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.link.heartbeat_interval_ms = 250;
    config.link.retry_delay_ms = 250;
    config.detection.calibration_dir = calibration_dir;
    config.detection.rest_duration_ms = 1_000;
    config.coordinator.offline_after_ms = 2_000;
    config.coordinator.sweep_interval_ms = 500;
    config.drill.target_count = targets;
    config.drill.countdown_ticks = 3;
    config.drill.countdown_tick_ms = 500;
    config.drill.inter_run_pause_ms = 1_500;
    config.drill.touch_timeout_ms = Some(10_000);
    config
}

/// A station the athlete can see and touch.
struct Station {
    node_id: NodeId,
    feedback: Arc<FeedbackController>,
    trigger: TapTrigger,
}

async fn start_station(config: &MeshConfig, node_id: NodeId, addr: &str, seed: u64) -> Result<(Station, NodeLink)> {
    let sensor = SimulatedSensor::new(SENSOR_NOISE_G, Some(seed));
    let trigger = sensor.trigger();
    let link = NodeLink::start_station(
        config,
        &node_id,
        addr,
        sensor,
        LogIndicator::new(node_id.clone()),
        Arc::new(LogAudio::new(node_id.clone())),
    )
    .await
    .with_context(|| format!("Failed to start station {node_id}"))?;
    let station = Station {
        feedback: Arc::clone(link.feedback()),
        node_id,
        trigger,
    };
    Ok((station, link))
}

/// Tap every target whose light turns active, once per activation.
async fn virtual_athlete(stations: Vec<Station>, reaction: Normal<f64>, seed: u64, cancel: CancellationToken) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tapped: HashSet<NodeId> = HashSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(WATCH_INTERVAL) => {}
        }
        for station in &stations {
            if station.feedback.get_state() != FeedbackState::Active {
                tapped.remove(&station.node_id);
                continue;
            }
            if !tapped.insert(station.node_id.clone()) {
                continue;
            }
            let delay_ms = reaction.sample(&mut rng).max(120.0);
            info!(node = %station.node_id, delay_ms = delay_ms.round(), "🏃 Athlete reacting");
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(delay_ms as u64)) => {}
            }
            station.trigger.tap(TAP_PEAK_G);
        }
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = SimArgs::parse();
    let seed = args.seed.unwrap_or_else(rand::random);
    let reaction = Normal::new(args.reaction_ms, args.reaction_sd_ms.abs())
        .map_err(|e| anyhow::anyhow!("Invalid reaction distribution: {e}"))?;

    let calibration_dir = std::env::temp_dir().join(format!("agility-mesh-sim-{}", uuid::Uuid::new_v4()));
    let config = sim_config(calibration_dir.clone(), args.targets);
    config.validate().context("Simulation config is invalid")?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Agility Mesh Simulation");
    info!("  {} targets | athletes {} | seed {}", args.targets, args.athletes.join(","), seed);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Coordinator
    let cancel = CancellationToken::new();
    let registry = Arc::new(NodeRegistry::from_config(&config.coordinator));
    let store = Arc::new(MemoryRunStore::new());
    let coordinator_node = config.coordinator.node_id.clone();
    let orchestrator = Orchestrator::new(
        config.drill.clone(),
        coordinator_node.clone(),
        Arc::clone(&registry),
        store.clone(),
        Arc::new(LogAudio::new(coordinator_node.clone())),
    );
    let (touch_tx, touch_rx) = mpsc::channel(defaults::INBOUND_TOUCH_CAPACITY);
    let listener = TcpListener::bind("127.0.0.1:0").await.context("Failed to bind loopback listener")?;
    let addr = listener.local_addr().context("Listener has no local address")?.to_string();

    let mut tasks = JoinSet::new();
    tasks.spawn(HeartbeatServer::new(Arc::clone(&registry), touch_tx).run(listener, cancel.clone()));
    {
        let registry = Arc::clone(&registry);
        let interval = Duration::from_millis(config.coordinator.sweep_interval_ms);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_liveness_sweep(registry, interval, cancel).await;
            Ok(())
        });
    }
    {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            run_touch_consumer(orchestrator, touch_rx, cancel).await;
            Ok(())
        });
    }

    // Stations, started together so their rest calibrations overlap
    let mut node_ids: Vec<NodeId> = vec![coordinator_node.clone()];
    node_ids.extend((1..=args.targets).map(|i| format!("cone-{i}")));
    let config = Arc::new(config);
    let mut starting = JoinSet::new();
    for (i, node_id) in node_ids.iter().enumerate() {
        let config = Arc::clone(&config);
        let node_id = node_id.clone();
        let addr = addr.clone();
        let station_seed = seed.wrapping_add(i as u64 + 1);
        starting.spawn(async move { start_station(&config, node_id, &addr, station_seed).await });
    }
    let mut stations = Vec::new();
    while let Some(started) = starting.join_next().await {
        let (station, link) = started.context("Station start panicked")??;
        let link_cancel = cancel.clone();
        tasks.spawn(async move {
            link.run(link_cancel).await;
            Ok(())
        });
        if station.node_id != coordinator_node {
            stations.push(station);
        }
    }

    let all_online = {
        let registry = Arc::clone(&registry);
        let node_ids = node_ids.clone();
        wait_until(move || node_ids.iter().all(|id| registry.is_online(id)), Duration::from_secs(10)).await
    };
    if !all_online {
        warn!("Not every station came online, starting anyway");
    }

    // Drill
    let mut targets: Vec<NodeId> = stations.iter().map(|s| s.node_id.clone()).collect();
    targets.sort();
    let new = NewSession::reaction("Simulated reaction", &targets, &args.athletes);
    let session_id = new.session.id.clone();
    let run_ids = new.session.run_ids.clone();
    store.put_new_session(new);

    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            virtual_athlete(stations, reaction, seed, cancel).await;
            Ok(())
        }
    });

    orchestrator
        .start_session_by_id(&session_id)
        .await
        .context("Failed to start the simulated session")?;

    let finished = {
        let orchestrator = orchestrator.clone();
        wait_until(move || !orchestrator.is_active(), Duration::from_secs(args.timeout_secs)).await
    };
    if !finished {
        warn!("Session did not finish in {}s, stopping it", args.timeout_secs);
        orchestrator.stop();
    }
    // Let the last run write land
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Results
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for run_id in &run_ids {
        let run = store.fetch_run(run_id).await?;
        let segments = store.segments_for_run(run_id).await?;
        let splits: Vec<String> = segments
            .iter()
            .map(|s| format!("{}@{}ms", s.node_id, s.split_ms))
            .collect();
        info!(
            "  {:<10} {:<10} {:>8}  {}",
            run.athlete,
            run.status.to_string(),
            run.elapsed_ms
                .map_or_else(|| run.failure.clone().unwrap_or_default(), |ms| format!("{ms}ms")),
            splits.join(" ")
        );
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    cancel.cancel();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Err(e)) => warn!(error = %e, "Task ended with error"),
            Err(e) => warn!(error = %e, "Task panicked"),
            Ok(Ok(())) => {}
        }
    }
    if let Err(e) = std::fs::remove_dir_all(&calibration_dir) {
        warn!(path = %calibration_dir.display(), error = %e, "Could not remove calibration directory");
    }
    info!("✓ Simulation complete");
    Ok(())
}
