//! Agility Mesh - reaction-drill coordinator and touch station
//!
//! # Usage
//!
//! ```bash
//! # Coordinator: heartbeat server, drill orchestrator, operator console
//! agility-mesh coordinator --listen 0.0.0.0:7070
//!
//! # One station
//! agility-mesh node --node-id cone-1 --coordinator 192.168.4.1:7070
//!
//! # Guided calibration of the local station
//! agility-mesh calibrate --node-id cone-1
//!
//! # Create a drill session in the run store
//! agility-mesh seed --targets cone-1,cone-2,cone-3,cone-4,cone-5 --athletes Ana,Ben
//!
//! # Effective configuration with defaults filled in
//! agility-mesh print-config
//! ```
//!
//! # Environment Variables
//!
//! - `AGILITY_CONFIG`: Path to the mesh config TOML (default: ./mesh_config.toml)
//! - `AGILITY_LISTEN_ADDR`: Coordinator heartbeat listen address
//! - `AGILITY_COORDINATOR_ADDR`: Coordinator address a station connects to
//! - `AGILITY_NODE_ID`: Station identity
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agility_mesh::calibration::CalibrationStore;
use agility_mesh::config::{self, defaults, MeshConfig};
use agility_mesh::console::{run_console, Console};
use agility_mesh::detection::{DetectionEngine, EngineConfig, SimulatedSensor};
use agility_mesh::feedback::{LogAudio, LogIndicator};
use agility_mesh::link::NodeLink;
use agility_mesh::orchestrator::{run_touch_consumer, Orchestrator};
use agility_mesh::registry::{run_liveness_sweep, NodeRegistry};
use agility_mesh::server::HeartbeatServer;
use agility_mesh::store::{NewSession, RunStore, SledRunStore};

/// Per-axis noise of the station's simulated accelerometer (g)
const SIM_NOISE_G: f64 = 0.01;

/// Spacing of simulated taps during `calibrate --simulate-taps` (ms)
const SIM_TAP_SPACING_MS: u64 = 1_200;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "agility-mesh")]
#[command(about = "Reaction-drill coordinator and touch station")]
#[command(version)]
struct CliArgs {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to the mesh config TOML (overrides the standard search order)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the coordinator: heartbeat server, orchestrator and operator console
    Coordinator {
        /// Heartbeat listen address (HOST:PORT)
        #[arg(long, env = "AGILITY_LISTEN_ADDR", value_name = "HOST:PORT")]
        listen: Option<String>,

        /// Do not run the co-located station in this process
        #[arg(long)]
        no_local_node: bool,
    },

    /// Run one station: detection, feedback and the heartbeat link
    Node {
        /// Station identity
        #[arg(long, env = "AGILITY_NODE_ID")]
        node_id: Option<String>,

        /// Coordinator address (HOST:PORT)
        #[arg(long, env = "AGILITY_COORDINATOR_ADDR", value_name = "HOST:PORT")]
        coordinator: Option<String>,

        /// Seed for the simulated accelerometer
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run guided tap calibration on the local station and save the profile
    Calibrate {
        /// Station identity
        #[arg(long, env = "AGILITY_NODE_ID")]
        node_id: Option<String>,

        /// Inject simulated taps of this peak (g) instead of waiting for real ones
        #[arg(long, value_name = "G")]
        simulate_taps: Option<f64>,
    },

    /// Create a reaction-drill session in the coordinator's run store
    Seed {
        /// Target node ids, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        targets: Vec<String>,

        /// Athlete names in run order, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        athletes: Vec<String>,

        /// Course name
        #[arg(long, default_value = "Reaction")]
        name: String,
    },

    /// Print the effective configuration as TOML
    PrintConfig,
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HeartbeatServer,
    LivenessSweep,
    TouchConsumer,
    Console,
    LocalNode,
    NodeLink,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HeartbeatServer => write!(f, "HeartbeatServer"),
            TaskName::LivenessSweep => write!(f, "LivenessSweep"),
            TaskName::TouchConsumer => write!(f, "TouchConsumer"),
            TaskName::Console => write!(f, "Console"),
            TaskName::LocalNode => write!(f, "LocalNode"),
            TaskName::NodeLink => write!(f, "NodeLink"),
        }
    }
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: Task failed with error: {:#}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("🔒 Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Let tasks observe cancellation and finish their cleanup
    while let Ok(Some(result)) =
        tokio::time::timeout(Duration::from_secs(3), task_set.join_next()).await
    {
        if let Ok(Err(e)) = result {
            warn!("Task failed during shutdown: {:#}", e);
        }
    }
    Ok(())
}

// ============================================================================
// Coordinator
// ============================================================================

/// Address the co-located station dials: loopback when bound to all interfaces.
fn local_dial_addr(bound: SocketAddr) -> String {
    if bound.ip().is_unspecified() {
        format!("127.0.0.1:{}", bound.port())
    } else {
        bound.to_string()
    }
}

fn run_store_path(config: &MeshConfig) -> PathBuf {
    config.coordinator.data_dir.join("runs.db")
}

async fn run_coordinator(
    config: &MeshConfig,
    listen: Option<String>,
    no_local_node: bool,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listen_addr = listen.unwrap_or_else(|| config.coordinator.listen_addr.clone());
    let coordinator_node = config.coordinator.node_id.clone();

    let store_path = run_store_path(config);
    let store = Arc::new(
        SledRunStore::open(&store_path)
            .with_context(|| format!("Failed to open run store at {}", store_path.display()))?,
    );
    info!("💾 Run store: {} ({})", store_path.display(), store.backend_name());

    let registry = Arc::new(NodeRegistry::from_config(&config.coordinator));
    let (touch_tx, touch_rx) = mpsc::channel(defaults::INBOUND_TOUCH_CAPACITY);
    let orchestrator = Orchestrator::new(
        config.drill.clone(),
        coordinator_node.clone(),
        Arc::clone(&registry),
        store.clone(),
        Arc::new(LogAudio::new(coordinator_node.clone())),
    );

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind heartbeat listener on {listen_addr}"))?;
    let bound = listener.local_addr().context("Listener has no local address")?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Agility Mesh Coordinator");
    info!("  Heartbeat: {} | Node: {}", bound, coordinator_node);
    info!(
        "  Drill: {} targets, {} x {}ms countdown, touch timeout {}",
        config.drill.target_count,
        config.drill.countdown_ticks,
        config.drill.countdown_tick_ms,
        config
            .drill
            .touch_timeout_ms
            .map_or_else(|| "off".to_string(), |ms| format!("{ms}ms"))
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    let server = HeartbeatServer::new(Arc::clone(&registry), touch_tx);
    let server_cancel = cancel_token.clone();
    task_set.spawn(async move {
        server
            .run(listener, server_cancel)
            .await
            .context("Heartbeat server failed")?;
        Ok(TaskName::HeartbeatServer)
    });

    let sweep_registry = Arc::clone(&registry);
    let sweep_interval = Duration::from_millis(config.coordinator.sweep_interval_ms);
    let sweep_cancel = cancel_token.clone();
    task_set.spawn(async move {
        run_liveness_sweep(sweep_registry, sweep_interval, sweep_cancel).await;
        Ok(TaskName::LivenessSweep)
    });

    let consumer = orchestrator.clone();
    let consumer_cancel = cancel_token.clone();
    task_set.spawn(async move {
        run_touch_consumer(consumer, touch_rx, consumer_cancel).await;
        Ok(TaskName::TouchConsumer)
    });

    let console = Console::new(orchestrator.clone(), Arc::clone(&registry));
    let console_cancel = cancel_token.clone();
    task_set.spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        run_console(console, stdin, console_cancel).await;
        Ok(TaskName::Console)
    });

    if config.coordinator.local_node && !no_local_node {
        let link = NodeLink::start_station(
            config,
            &coordinator_node,
            &local_dial_addr(bound),
            SimulatedSensor::new(SIM_NOISE_G, None),
            LogIndicator::new(coordinator_node.clone()),
            Arc::new(LogAudio::new(coordinator_node.clone())),
        )
        .await
        .context("Failed to start the co-located station")?;
        let link_cancel = cancel_token.clone();
        task_set.spawn(async move {
            link.run(link_cancel).await;
            Ok(TaskName::LocalNode)
        });
    }

    let result = run_supervisor(&mut task_set, cancel_token).await;

    if orchestrator.is_active() {
        orchestrator.stop();
        // Give the spawned run write a moment before flushing
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if let Err(e) = store.flush() {
        warn!(error = %e, "Run store flush failed");
    }
    result
}

// ============================================================================
// Station
// ============================================================================

async fn run_node(
    config: &MeshConfig,
    node_id: Option<String>,
    coordinator: Option<String>,
    seed: Option<u64>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let node_id = node_id.unwrap_or_else(|| config.station.node_id.clone());
    let coordinator = coordinator.unwrap_or_else(|| config.station.coordinator_addr.clone());

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Agility Mesh Station");
    info!("  Node: {} | Coordinator: {}", node_id, coordinator);
    info!(
        "  Heartbeat every {}ms | Sensor {:?} @ {}Hz",
        config.link.heartbeat_interval_ms, config.station.sensor_mode, config.detection.sample_rate_hz
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let link = NodeLink::start_station(
        config,
        &node_id,
        &coordinator,
        SimulatedSensor::new(SIM_NOISE_G, seed),
        LogIndicator::new(node_id.clone()),
        Arc::new(LogAudio::new(node_id.clone())),
    )
    .await
    .with_context(|| format!("Failed to start station {node_id}"))?;

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    let link_cancel = cancel_token.clone();
    task_set.spawn(async move {
        link.run(link_cancel).await;
        Ok(TaskName::NodeLink)
    });
    run_supervisor(&mut task_set, cancel_token).await
}

async fn run_calibrate(config: &MeshConfig, node_id: Option<String>, simulate_taps: Option<f64>) -> Result<()> {
    let node_id = node_id.unwrap_or_else(|| config.station.node_id.clone());
    let store = CalibrationStore::new(&config.detection.calibration_dir);
    let sensor = SimulatedSensor::new(SIM_NOISE_G, None);
    let trigger = sensor.trigger();

    // Taps are not needed by this command
    let (touch_tx, _touch_rx) = mpsc::channel(defaults::TOUCH_CHANNEL_CAPACITY);
    let mut handle = DetectionEngine::start(EngineConfig::from_mesh(config, &node_id), sensor, store.clone(), touch_tx)
        .await
        .context("Detection engine failed to start")?;

    info!(
        "🎯 Guided calibration for {}: tap the station {} times",
        node_id, config.guided.taps
    );
    let tapper = simulate_taps.map(|peak_g| {
        let taps = config.guided.taps;
        tokio::spawn(async move {
            for _ in 0..taps {
                tokio::time::sleep(Duration::from_millis(SIM_TAP_SPACING_MS)).await;
                trigger.tap(peak_g);
            }
        })
    });

    let result = handle.guided().await;
    if let Some(tapper) = tapper {
        tapper.abort();
    }
    handle.shutdown();

    let result = result.context("Guided calibration failed")?;
    info!(
        "✓ Threshold {:.3}g (noise floor {:.3}g, weakest tap {:.3}g, peaks {:?})",
        result.threshold_g, result.noise_floor_g, result.min_tap_g, result.peaks_g
    );
    info!("  Profile saved to {}", store.path_for(&node_id).display());
    Ok(())
}

fn run_seed(config: &MeshConfig, name: &str, targets: &[String], athletes: &[String]) -> Result<()> {
    let store_path = run_store_path(config);
    let store = SledRunStore::open(&store_path)
        .with_context(|| format!("Failed to open run store at {} (is the coordinator running?)", store_path.display()))?;
    let new = NewSession::reaction(name, targets, athletes);
    store.put_new_session(&new).context("Failed to write session")?;
    store.flush().context("Failed to flush run store")?;
    info!(
        "✓ Session {} created: {} runs over {}",
        new.session.id,
        new.runs.len(),
        targets.join(",")
    );
    println!("{}", new.session.id);
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries command output (session ids, config dumps)
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let mesh_config = match &args.config {
        Some(path) => MeshConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MeshConfig::load(),
    };
    config::init(mesh_config);
    let config = config::get();

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    match args.command {
        SubCommand::Coordinator {
            listen,
            no_local_node,
        } => run_coordinator(config, listen, no_local_node, cancel_token).await?,
        SubCommand::Node {
            node_id,
            coordinator,
            seed,
        } => run_node(config, node_id, coordinator, seed, cancel_token).await?,
        SubCommand::Calibrate {
            node_id,
            simulate_taps,
        } => run_calibrate(config, node_id, simulate_taps).await?,
        SubCommand::Seed {
            targets,
            athletes,
            name,
        } => run_seed(config, &name, &targets, &athletes)?,
        SubCommand::PrintConfig => {
            print!("{}", config.to_toml().context("Failed to serialize config")?);
            return Ok(());
        }
    }

    info!("✓ Agility Mesh shutdown complete");
    Ok(())
}
