//! Mesh Configuration - station, link, detection and drill tuning as TOML values
//!
//! Every timing constant and detection parameter used by the coordinator and
//! the stations is a field in this module. Each struct implements `Default`
//! with the values in [`super::defaults`], so a missing or partial config file
//! behaves exactly like the built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::defaults;
use crate::calibration::SensorMode;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "AGILITY_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "mesh_config.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration shared by the coordinator and every station.
///
/// Load with `MeshConfig::load()` which searches:
/// 1. `$AGILITY_CONFIG` env var
/// 2. `./mesh_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Station identity and hardware description
    #[serde(default)]
    pub station: StationConfig,

    /// Heartbeat link timing
    #[serde(default)]
    pub link: LinkConfig,

    /// Touch detection and auto-calibration
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Guided (operator-invoked) calibration
    #[serde(default)]
    pub guided: GuidedConfig,

    /// Status light rendering
    #[serde(default)]
    pub feedback: FeedbackConfig,

    /// Coordinator-side registry and server
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Reaction drill sequencing
    #[serde(default)]
    pub drill: DrillConfig,
}

impl MeshConfig {
    /// Load configuration using the standard search order:
    /// 1. `$AGILITY_CONFIG` environment variable
    /// 2. `./mesh_config.toml` in the current working directory
    /// 3. Built-in defaults
    ///
    /// A file that fails to load is logged and the next source is tried.
    pub fn load() -> Self {
        let candidates = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .into_iter()
            .chain(std::iter::once(PathBuf::from(LOCAL_CONFIG_FILE)));
        for path in candidates {
            if !path.exists() {
                debug!(path = %path.display(), "Config file not found, skipping");
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!(path = %path.display(), node = %config.station.node_id, "Loaded mesh config");
                    return config;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to load mesh config, falling back"),
            }
        }
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load and validate one TOML file. Unknown keys are logged, not fatal.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        for warning in super::validation::validate_unknown_keys(&contents) {
            warn!(path = %path.display(), "{warning}");
        }
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective configuration as TOML, defaults filled in.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all values for internal consistency.
    ///
    /// Rules:
    /// - Rates, counts and intervals used as divisors or loop bounds must be > 0
    /// - The heartbeat interval must be shorter than the offline timeout
    /// - The drill poll interval may not exceed the heartbeat interval
    /// - The guided threshold ratio must lie strictly inside (0, 1)
    /// - The coordinator debounce may not exceed the station debounce
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.station.node_id.trim().is_empty() {
            errors.push("station.node_id must not be empty".to_string());
        }
        if self.coordinator.node_id.trim().is_empty() {
            errors.push("coordinator.node_id must not be empty".to_string());
        }

        // Link
        let l = &self.link;
        if l.heartbeat_interval_ms == 0 {
            errors.push("link.heartbeat_interval_ms must be > 0".to_string());
        }
        if l.drill_poll_ms == 0 || l.drill_poll_ms > l.heartbeat_interval_ms {
            errors.push(format!(
                "link.drill_poll_ms ({}) must be > 0 and <= link.heartbeat_interval_ms ({})",
                l.drill_poll_ms, l.heartbeat_interval_ms
            ));
        }
        if l.io_timeout_ms == 0 || l.connect_timeout_ms == 0 {
            errors.push("link.io_timeout_ms and link.connect_timeout_ms must be > 0".to_string());
        }
        if l.heartbeat_interval_ms >= self.coordinator.offline_after_ms {
            errors.push(format!(
                "link.heartbeat_interval_ms ({}) must be < coordinator.offline_after_ms ({})",
                l.heartbeat_interval_ms, self.coordinator.offline_after_ms
            ));
        }

        // Detection
        let d = &self.detection;
        if d.sample_rate_hz == 0 {
            errors.push("detection.sample_rate_hz must be > 0".to_string());
        }
        if d.min_rest_samples == 0 {
            errors.push("detection.min_rest_samples must be > 0".to_string());
        }
        Self::check_positive(d.default_threshold_g, "detection.default_threshold_g", &mut errors);
        Self::check_positive(d.noise_sigma, "detection.noise_sigma", &mut errors);
        if d.coordinator_debounce_ms > d.debounce_ms {
            errors.push(format!(
                "detection.coordinator_debounce_ms ({}) must be <= debounce_ms ({})",
                d.coordinator_debounce_ms, d.debounce_ms
            ));
        }
        let expected_rest = d.rest_duration_ms * u64::from(d.sample_rate_hz) / 1000;
        if expected_rest < d.min_rest_samples as u64 {
            errors.push(format!(
                "detection.rest_duration_ms ({}) at {} Hz yields {} samples, below min_rest_samples ({})",
                d.rest_duration_ms, d.sample_rate_hz, expected_rest, d.min_rest_samples
            ));
        }

        // Guided calibration
        let g = &self.guided;
        if g.taps == 0 {
            errors.push("guided.taps must be > 0".to_string());
        }
        if g.tap_timeout_ms == 0 {
            errors.push("guided.tap_timeout_ms must be > 0".to_string());
        }
        Self::check_positive(g.initial_accept_g, "guided.initial_accept_g", &mut errors);
        Self::check_positive(g.threshold_step_g, "guided.threshold_step_g", &mut errors);
        if !(g.threshold_ratio > 0.0 && g.threshold_ratio < 1.0) {
            errors.push(format!(
                "guided.threshold_ratio ({}) must be strictly between 0 and 1",
                g.threshold_ratio
            ));
        }

        // Feedback
        if self.feedback.frame_ms == 0 {
            errors.push("feedback.frame_ms must be > 0".to_string());
        }

        // Coordinator
        if self.coordinator.sweep_interval_ms == 0 {
            errors.push("coordinator.sweep_interval_ms must be > 0".to_string());
        }

        // Drill
        if self.drill.target_count == 0 {
            errors.push("drill.target_count must be > 0".to_string());
        }
        if self.drill.touch_timeout_ms == Some(0) {
            errors.push("drill.touch_timeout_ms must be > 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_positive(value: f64, name: &str, errors: &mut Vec<String>) {
        // NaN passes every range comparison
        if !value.is_finite() || value <= 0.0 {
            errors.push(format!("{name} must be a finite number > 0 (got {value})"));
        }
    }

    /// Debounce interval for `node_id`: the coordinator's co-located sensor
    /// uses the shorter window.
    pub fn debounce_for(&self, node_id: &str) -> Duration {
        if node_id == self.coordinator.node_id {
            Duration::from_millis(self.detection.coordinator_debounce_ms)
        } else {
            Duration::from_millis(self.detection.debounce_ms)
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Station
// ============================================================================

/// Identity and hardware description of the local station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Stable node identity reported in every heartbeat
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Coordinator heartbeat endpoint (HOST:PORT)
    #[serde(default = "default_coordinator_addr")]
    pub coordinator_addr: String,

    /// Mesh hop count reported to the coordinator
    #[serde(default = "default_hops")]
    pub hops: u8,

    /// Accelerometer full-scale range
    #[serde(default)]
    pub sensor_mode: SensorMode,

    /// Sensor bus address (I2C)
    #[serde(default = "default_bus_address")]
    pub bus_address: u8,

    /// Whether accelerometer readings are already scaled to g
    #[serde(default = "default_true")]
    pub g_force: bool,

    /// Simulated battery level at start (percent)
    #[serde(default = "default_battery_start")]
    pub battery_start_pct: f64,

    /// Simulated battery drain (percent per hour)
    #[serde(default = "default_battery_drain")]
    pub battery_drain_pct_per_hour: f64,
}

fn default_node_id() -> String {
    defaults::STATION_NODE_ID.to_string()
}
fn default_coordinator_addr() -> String {
    defaults::COORDINATOR_ADDR.to_string()
}
fn default_hops() -> u8 {
    1
}
fn default_bus_address() -> u8 {
    defaults::SENSOR_BUS_ADDRESS
}
fn default_true() -> bool {
    true
}
fn default_battery_start() -> f64 {
    100.0
}
fn default_battery_drain() -> f64 {
    defaults::BATTERY_DRAIN_PCT_PER_HOUR
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            coordinator_addr: default_coordinator_addr(),
            hops: default_hops(),
            sensor_mode: SensorMode::default(),
            bus_address: default_bus_address(),
            g_force: default_true(),
            battery_start_pct: default_battery_start(),
            battery_drain_pct_per_hour: default_battery_drain(),
        }
    }
}

// ============================================================================
// Link
// ============================================================================

/// Heartbeat link timing (station side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Interval between periodic status reports (ms)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Interval between reports while the coordinator runs a drill (ms)
    #[serde(default = "default_drill_poll")]
    pub drill_poll_ms: u64,

    /// Fixed delay between reconnection attempts (ms)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// TCP connect timeout (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Per-line send/receive timeout (ms)
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

fn default_heartbeat_interval() -> u64 {
    defaults::HEARTBEAT_INTERVAL_MS
}
fn default_drill_poll() -> u64 {
    defaults::DRILL_POLL_MS
}
fn default_retry_delay() -> u64 {
    defaults::LINK_RETRY_DELAY_MS
}
fn default_connect_timeout() -> u64 {
    defaults::LINK_CONNECT_TIMEOUT_MS
}
fn default_io_timeout() -> u64 {
    defaults::LINK_IO_TIMEOUT_MS
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            drill_poll_ms: default_drill_poll(),
            retry_delay_ms: default_retry_delay(),
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

// ============================================================================
// Detection
// ============================================================================

/// Touch detection and auto-calibration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Accelerometer sampling rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,

    /// Minimum time between two accepted touches on a station (ms)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Debounce for the coordinator's co-located station (ms)
    #[serde(default = "default_coordinator_debounce")]
    pub coordinator_debounce_ms: u64,

    /// Threshold used by auto-calibration when the noise floor is quiet (g)
    #[serde(default = "default_threshold")]
    pub default_threshold_g: f64,

    /// Rest sampling window for baseline measurement (ms)
    #[serde(default = "default_rest_duration")]
    pub rest_duration_ms: u64,

    /// Minimum rest samples for a valid baseline
    #[serde(default = "default_min_rest_samples")]
    pub min_rest_samples: usize,

    /// Sigma multiplier above the noise floor for auto-calibrated thresholds
    #[serde(default = "default_noise_sigma")]
    pub noise_sigma: f64,

    /// Directory holding per-node calibration files
    #[serde(default = "default_calibration_dir")]
    pub calibration_dir: PathBuf,
}

fn default_sample_rate() -> u32 {
    defaults::SAMPLE_RATE_HZ
}
fn default_debounce() -> u64 {
    defaults::DEBOUNCE_MS
}
fn default_coordinator_debounce() -> u64 {
    defaults::COORDINATOR_DEBOUNCE_MS
}
fn default_threshold() -> f64 {
    defaults::DEFAULT_THRESHOLD_G
}
fn default_rest_duration() -> u64 {
    defaults::REST_DURATION_MS
}
fn default_min_rest_samples() -> usize {
    defaults::MIN_REST_SAMPLES
}
fn default_noise_sigma() -> f64 {
    defaults::NOISE_SIGMA
}
fn default_calibration_dir() -> PathBuf {
    PathBuf::from(defaults::CALIBRATION_DIR)
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: default_sample_rate(),
            debounce_ms: default_debounce(),
            coordinator_debounce_ms: default_coordinator_debounce(),
            default_threshold_g: default_threshold(),
            rest_duration_ms: default_rest_duration(),
            min_rest_samples: default_min_rest_samples(),
            noise_sigma: default_noise_sigma(),
            calibration_dir: default_calibration_dir(),
        }
    }
}

impl DetectionConfig {
    /// Interval between two sensor reads.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.sample_rate_hz.max(1)))
    }

    /// Number of samples covering `duration` at the configured rate.
    pub fn samples_for(&self, duration: Duration) -> usize {
        (duration.as_millis() as u64 * u64::from(self.sample_rate_hz) / 1000) as usize
    }
}

// ============================================================================
// Guided Calibration
// ============================================================================

/// Operator-invoked tap calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidedConfig {
    /// Number of deliberate taps to record
    #[serde(default = "default_taps")]
    pub taps: usize,

    /// Time allowed for each tap before the acceptance threshold is lowered (ms)
    #[serde(default = "default_tap_timeout")]
    pub tap_timeout_ms: u64,

    /// Amount the acceptance threshold drops after a tap timeout (g)
    #[serde(default = "default_threshold_step")]
    pub threshold_step_g: f64,

    /// Retries per tap after the first timeout
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Starting acceptance threshold (g above baseline)
    #[serde(default = "default_initial_accept")]
    pub initial_accept_g: f64,

    /// Quiet time after a tap before the next one is armed (ms)
    #[serde(default = "default_tap_settle")]
    pub tap_settle_ms: u64,

    /// Position of the recommended threshold between noise floor and weakest tap
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,
}

fn default_taps() -> usize {
    defaults::GUIDED_TAPS
}
fn default_tap_timeout() -> u64 {
    defaults::GUIDED_TAP_TIMEOUT_MS
}
fn default_threshold_step() -> f64 {
    defaults::GUIDED_THRESHOLD_STEP_G
}
fn default_max_retries() -> u32 {
    defaults::GUIDED_MAX_RETRIES
}
fn default_initial_accept() -> f64 {
    defaults::GUIDED_INITIAL_ACCEPT_G
}
fn default_tap_settle() -> u64 {
    defaults::GUIDED_TAP_SETTLE_MS
}
fn default_threshold_ratio() -> f64 {
    defaults::GUIDED_THRESHOLD_RATIO
}

impl Default for GuidedConfig {
    fn default() -> Self {
        Self {
            taps: default_taps(),
            tap_timeout_ms: default_tap_timeout(),
            threshold_step_g: default_threshold_step(),
            max_retries: default_max_retries(),
            initial_accept_g: default_initial_accept(),
            tap_settle_ms: default_tap_settle(),
            threshold_ratio: default_threshold_ratio(),
        }
    }
}

// ============================================================================
// Feedback
// ============================================================================

/// Status light render loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Render loop frame interval (ms)
    #[serde(default = "default_frame")]
    pub frame_ms: u64,

    /// Full on/off period for blinking states (ms)
    #[serde(default = "default_blink_period")]
    pub blink_period_ms: u64,

    /// Length of one-shot animations such as `success` (ms)
    #[serde(default = "default_animation")]
    pub animation_ms: u64,
}

fn default_frame() -> u64 {
    defaults::FEEDBACK_FRAME_MS
}
fn default_blink_period() -> u64 {
    defaults::FEEDBACK_BLINK_PERIOD_MS
}
fn default_animation() -> u64 {
    defaults::FEEDBACK_ANIMATION_MS
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            frame_ms: default_frame(),
            blink_period_ms: default_blink_period(),
            animation_ms: default_animation(),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Coordinator-side registry and heartbeat server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Heartbeat server bind address.
    ///
    /// Can be overridden by `AGILITY_LISTEN_ADDR` env var or `--listen` CLI flag.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Node identity of the coordinator's own co-located station
    #[serde(default = "default_coordinator_node_id")]
    pub node_id: String,

    /// Staleness window before a silent node is marked offline (ms)
    #[serde(default = "default_offline_after")]
    pub offline_after_ms: u64,

    /// Liveness sweep interval (ms)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Directory for the run store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Run the co-located station inside the coordinator process
    #[serde(default = "default_true")]
    pub local_node: bool,
}

fn default_listen_addr() -> String {
    defaults::LISTEN_ADDR.to_string()
}
fn default_coordinator_node_id() -> String {
    defaults::COORDINATOR_NODE_ID.to_string()
}
fn default_offline_after() -> u64 {
    defaults::OFFLINE_AFTER_MS
}
fn default_sweep_interval() -> u64 {
    defaults::SWEEP_INTERVAL_MS
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            node_id: default_coordinator_node_id(),
            offline_after_ms: default_offline_after(),
            sweep_interval_ms: default_sweep_interval(),
            data_dir: default_data_dir(),
            local_node: default_true(),
        }
    }
}

// ============================================================================
// Drill
// ============================================================================

/// Reaction drill sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillConfig {
    /// Countdown ticks before "go"
    #[serde(default = "default_countdown_ticks")]
    pub countdown_ticks: u32,

    /// Length of one countdown tick (ms)
    #[serde(default = "default_countdown_tick")]
    pub countdown_tick_ms: u64,

    /// Number of eligible target nodes a drill must name
    #[serde(default = "default_target_count")]
    pub target_count: usize,

    /// Fail the run when an armed target is not touched in time (ms).
    /// Unset means an untouched target stalls the run until an operator stops it.
    #[serde(default)]
    pub touch_timeout_ms: Option<u64>,

    /// Pause after a run finishes before the next run (or session end) (ms)
    #[serde(default = "default_inter_run_pause")]
    pub inter_run_pause_ms: u64,
}

fn default_countdown_ticks() -> u32 {
    defaults::COUNTDOWN_TICKS
}
fn default_countdown_tick() -> u64 {
    defaults::COUNTDOWN_TICK_MS
}
fn default_target_count() -> usize {
    defaults::DRILL_TARGET_COUNT
}
fn default_inter_run_pause() -> u64 {
    defaults::INTER_RUN_PAUSE_MS
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            countdown_ticks: default_countdown_ticks(),
            countdown_tick_ms: default_countdown_tick(),
            target_count: default_target_count(),
            touch_timeout_ms: None,
            inter_run_pause_ms: default_inter_run_pause(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
