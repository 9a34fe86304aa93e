//! Calibration - rest baselines, detection thresholds and their persistence
//!
//! A station's [`CalibrationProfile`] holds the rest baseline vector, the rest
//! noise floor and the detection threshold. It is produced either by the
//! automatic rest measurement (see [`RestAccumulator`]) or by the operator's
//! guided tap procedure (see [`GuidedCalibration`]), and persisted through
//! [`CalibrationStore`].
//!
//! Invariant: a valid profile's threshold is strictly above its noise floor.

mod accumulator;
mod guided;
mod store;

pub use accumulator::{auto_threshold, RestAccumulator, RestBaseline, Welford};
pub use guided::{recommend_threshold, GuidedCalibration, GuidedResult, GuidedStep};
pub use store::CalibrationStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{NodeId, Vector3};

/// Calibration file schema version.
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Insufficient rest samples: have {collected}, need {required}")]
    InsufficientSamples { collected: usize, required: usize },

    #[error("No tap detected for tap {tap} after {attempts} attempts")]
    TapTimeout { tap: usize, attempts: u32 },

    #[error("Weakest tap ({min_tap_g:.3}g) is not above the rest baseline ({baseline_g:.3}g)")]
    TapsBelowBaseline { min_tap_g: f64, baseline_g: f64 },

    #[error("Threshold {threshold_g:.3}g is not above the rest noise floor ({noise_floor_g:.3}g)")]
    ThresholdNotAboveFloor { threshold_g: f64, noise_floor_g: f64 },

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Calibration aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Sensor Mode
// ============================================================================

/// Accelerometer full-scale range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
pub enum SensorMode {
    #[default]
    #[serde(rename = "2g")]
    G2,
    #[serde(rename = "4g")]
    G4,
    #[serde(rename = "8g")]
    G8,
    #[serde(rename = "16g")]
    G16,
}

impl SensorMode {
    /// Full-scale range per axis (g).
    pub fn range_g(&self) -> f64 {
        match self {
            SensorMode::G2 => 2.0,
            SensorMode::G4 => 4.0,
            SensorMode::G8 => 8.0,
            SensorMode::G16 => 16.0,
        }
    }
}

impl std::fmt::Display for SensorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "±{}g", self.range_g())
    }
}

// ============================================================================
// Calibration Profile
// ============================================================================

/// Persisted per-node calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub schema_version: u32,
    pub node_id: NodeId,
    /// Mean rest reading (g)
    pub baseline: Vector3,
    /// Mean deviation magnitude at rest (g)
    pub noise_floor_g: f64,
    /// Detection threshold on deviation magnitude (g)
    pub threshold_g: f64,
    pub sensor_mode: SensorMode,
    #[serde(default = "default_g_force")]
    pub g_force: bool,
    #[serde(default)]
    pub bus_address: u8,
    pub calibrated_at: DateTime<Utc>,
}

fn default_g_force() -> bool {
    true
}

impl CalibrationProfile {
    pub fn new(
        node_id: impl Into<NodeId>,
        rest: &RestBaseline,
        threshold_g: f64,
        sensor_mode: SensorMode,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            node_id: node_id.into(),
            baseline: rest.baseline,
            noise_floor_g: rest.noise_floor_g,
            threshold_g,
            sensor_mode,
            g_force: true,
            bus_address: 0,
            calibrated_at: Utc::now(),
        }
    }

    pub fn with_hardware(mut self, g_force: bool, bus_address: u8) -> Self {
        self.g_force = g_force;
        self.bus_address = bus_address;
        self
    }

    /// Every number finite, threshold above the noise floor, current schema.
    pub fn is_valid(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
            && self.baseline.is_finite()
            && self.noise_floor_g.is_finite()
            && self.threshold_g.is_finite()
            && self.noise_floor_g >= 0.0
            && self.threshold_g > self.noise_floor_g
    }

    /// Copy with a new threshold and timestamp.
    pub fn with_threshold(&self, threshold_g: f64) -> Self {
        Self {
            threshold_g,
            calibrated_at: Utc::now(),
            ..self.clone()
        }
    }
}
