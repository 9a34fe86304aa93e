//! Touch Detection - accelerometer sampling, debounced touches, calibration
//!
//! Each station runs one [`DetectionEngine`] on a dedicated thread that owns
//! the [`MotionSensor`]. The engine:
//!
//! 1. Loads the node's calibration profile, auto-calibrating once if the file
//!    is missing or invalid (failure is returned from [`DetectionEngine::start`])
//! 2. Samples at the configured rate and publishes a [`SensorSnapshot`] per sample
//! 3. Emits a [`TouchEvent`] when the deviation from baseline crosses the
//!    threshold outside the debounce window
//! 4. Applies control messages between samples: threshold changes, guided
//!    calibration and test mode
//!
//! [`SensorSnapshot`]: crate::types::SensorSnapshot
//! [`TouchEvent`]: crate::types::TouchEvent

mod detector;
mod engine;
mod sensor;

pub use detector::TouchDetector;
pub use engine::{DetectionEngine, DetectionHandle, EngineConfig};
pub use sensor::{Environment, MotionSensor, SensorError, SimulatedSensor, TapTrigger};

use thiserror::Error;

use crate::calibration::CalibrationError;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Detection engine is not running")]
    EngineStopped,

    #[error("Failed to spawn detection thread: {0}")]
    Spawn(#[from] std::io::Error),
}
