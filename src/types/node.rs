//! Node report types: identity, status, sensor snapshot, hardware health

use serde::{Deserialize, Serialize};

/// Stable node identity (address or configured name).
pub type NodeId = String;

// ============================================================================
// Vector3
// ============================================================================

/// Three-axis accelerometer reading in g.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Self) -> f64 {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z).magnitude()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Clamp every axis to `[-limit, limit]`.
    pub fn clamp(&self, limit: f64) -> Self {
        Self::new(
            self.x.clamp(-limit, limit),
            self.y.clamp(-limit, limit),
            self.z.clamp(-limit, limit),
        )
    }
}

impl std::fmt::Display for Vector3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

// ============================================================================
// Reported Status
// ============================================================================

/// Operational status a station reports about itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Detection running, no exercise in progress
    #[default]
    Ready,
    /// Executing an assigned exercise
    Busy,
    /// Guided or automatic calibration in progress
    Calibrating,
    /// Detection could not start (e.g. calibration failed)
    Error,
    /// Status string this build does not know
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Calibrating => write!(f, "calibrating"),
            NodeStatus::Error => write!(f, "error"),
            NodeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

// ============================================================================
// Sensor Snapshot
// ============================================================================

/// Latest sensor state as published by the detection engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Raw accelerometer vector (g)
    pub accel: Vector3,

    /// Deviation magnitude from the calibrated baseline (g)
    #[serde(default)]
    pub deviation_g: f64,

    /// Active detection threshold (g)
    #[serde(default)]
    pub threshold_g: f64,

    /// Board temperature (°C)
    #[serde(default)]
    pub temperature_c: Option<f64>,

    /// Relative humidity (%)
    #[serde(default)]
    pub humidity_pct: Option<f64>,
}

// ============================================================================
// Hardware Health
// ============================================================================

/// Per-peripheral health flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareHealth {
    #[serde(default = "healthy")]
    pub sensor_ok: bool,
    #[serde(default = "healthy")]
    pub indicator_ok: bool,
    #[serde(default = "healthy")]
    pub audio_ok: bool,
    /// Battery below the low-charge mark
    #[serde(default)]
    pub battery_low: bool,
}

fn healthy() -> bool {
    true
}

impl Default for HardwareHealth {
    fn default() -> Self {
        Self {
            sensor_ok: true,
            indicator_ok: true,
            audio_ok: true,
            battery_low: false,
        }
    }
}

impl HardwareHealth {
    pub fn all_ok(&self) -> bool {
        self.sensor_ok && self.indicator_ok && self.audio_ok && !self.battery_low
    }
}
