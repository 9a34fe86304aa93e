//! System-wide default constants.
//!
//! Centralises the tunable numbers used by the config structs.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Station
// ============================================================================

/// Node id used when a station config names none.
pub const STATION_NODE_ID: &str = "node-1";

/// Default coordinator heartbeat endpoint.
pub const COORDINATOR_ADDR: &str = "127.0.0.1:7070";

/// I2C address of the accelerometer on the reference board.
pub const SENSOR_BUS_ADDRESS: u8 = 0x18;

/// Simulated battery drain (percent per hour).
pub const BATTERY_DRAIN_PCT_PER_HOUR: f64 = 8.0;

// ============================================================================
// Link
// ============================================================================

/// Interval between periodic heartbeats (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 3_000;

/// Heartbeat interval while a drill session is in progress (ms). Bounds how
/// long an armed target takes to light.
pub const DRILL_POLL_MS: u64 = 100;

/// Fixed delay between reconnection attempts (ms).
pub const LINK_RETRY_DELAY_MS: u64 = 2_000;

/// TCP connect timeout (ms).
pub const LINK_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Per-line read/write timeout (ms).
pub const LINK_IO_TIMEOUT_MS: u64 = 2_000;

/// Maximum heartbeat line length in bytes (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Touches held for redelivery before the oldest is dropped.
pub const MAX_UNACKED_TOUCHES: usize = 32;

// ============================================================================
// Detection
// ============================================================================

/// Accelerometer sampling rate (Hz).
pub const SAMPLE_RATE_HZ: u32 = 100;

/// Debounce between accepted touches on a remote station (ms).
pub const DEBOUNCE_MS: u64 = 500;

/// Debounce for the coordinator's co-located station (ms).
///
/// Shorter because that station is not mounted next to another node.
pub const COORDINATOR_DEBOUNCE_MS: u64 = 250;

/// Auto-calibration threshold floor (g above baseline).
pub const DEFAULT_THRESHOLD_G: f64 = 0.5;

/// Rest sampling window for the baseline (ms). 2 s at 100 Hz = 200 samples.
pub const REST_DURATION_MS: u64 = 2_000;

/// Minimum rest samples for a valid baseline.
pub const MIN_REST_SAMPLES: usize = 50;

/// Sigma multiplier above the rest noise floor for auto thresholds.
pub const NOISE_SIGMA: f64 = 6.0;

/// Directory holding `calibration_<node>.json` files.
pub const CALIBRATION_DIR: &str = "./data/calibration";

/// Capacity of the per-station touch channel.
pub const TOUCH_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Guided Calibration
// ============================================================================

/// Number of deliberate taps recorded.
pub const GUIDED_TAPS: usize = 5;

/// Time allowed per tap before lowering the acceptance threshold (ms).
pub const GUIDED_TAP_TIMEOUT_MS: u64 = 10_000;

/// Acceptance threshold drop after a tap timeout (g).
pub const GUIDED_THRESHOLD_STEP_G: f64 = 0.05;

/// Retries per tap after the first timeout.
pub const GUIDED_MAX_RETRIES: u32 = 3;

/// Starting acceptance threshold (g above baseline).
pub const GUIDED_INITIAL_ACCEPT_G: f64 = 0.3;

/// Quiet time after a recorded tap before the next is armed (ms).
pub const GUIDED_TAP_SETTLE_MS: u64 = 300;

/// Recommended threshold position between noise floor and weakest tap.
///
/// `threshold = floor + 0.6 * (min_tap - floor)`
pub const GUIDED_THRESHOLD_RATIO: f64 = 0.6;

// ============================================================================
// Feedback
// ============================================================================

/// Render loop frame interval (ms).
pub const FEEDBACK_FRAME_MS: u64 = 20;

/// Blink period for blinking states (ms).
pub const FEEDBACK_BLINK_PERIOD_MS: u64 = 500;

/// One-shot animation length (ms).
pub const FEEDBACK_ANIMATION_MS: u64 = 1_500;

// ============================================================================
// Coordinator
// ============================================================================

/// Heartbeat server bind address.
pub const LISTEN_ADDR: &str = "0.0.0.0:7070";

/// Node id of the coordinator's co-located station.
pub const COORDINATOR_NODE_ID: &str = "coordinator";

/// Staleness window before a node is marked offline (ms).
pub const OFFLINE_AFTER_MS: u64 = 10_000;

/// Liveness sweep interval (ms).
pub const SWEEP_INTERVAL_MS: u64 = 1_000;

/// Pending commands held per node before the oldest is dropped.
pub const MAX_PENDING_COMMANDS: usize = 16;

/// Run store directory.
pub const DATA_DIR: &str = "./data/runs";

/// Capacity of the server-to-orchestrator touch channel.
pub const INBOUND_TOUCH_CAPACITY: usize = 256;

// ============================================================================
// Drill
// ============================================================================

/// Countdown ticks before "go".
pub const COUNTDOWN_TICKS: u32 = 5;

/// Length of one countdown tick (ms).
pub const COUNTDOWN_TICK_MS: u64 = 1_000;

/// Eligible target nodes per drill.
pub const DRILL_TARGET_COUNT: usize = 5;

/// Pause between runs, while the success animation plays (ms).
pub const INTER_RUN_PAUSE_MS: u64 = 3_000;
