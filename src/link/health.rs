//! Station hardware health and battery estimate

use std::time::Instant;

use crate::types::HardwareHealth;

/// Battery percentage below which `battery_low` is raised.
pub const LOW_BATTERY_PCT: f64 = 15.0;

/// Source of the health fields carried in each heartbeat.
pub trait HealthProbe: Send + Sync {
    /// Estimated charge (0-100 %), if the board can tell.
    fn battery_pct(&self) -> Option<f64>;

    /// Peripheral flags. `sensor_ok` comes from the detection engine.
    fn health(&self, sensor_ok: bool) -> HardwareHealth {
        HardwareHealth {
            sensor_ok,
            indicator_ok: true,
            audio_ok: true,
            battery_low: self.battery_pct().is_some_and(|pct| pct < LOW_BATTERY_PCT),
        }
    }
}

/// Linear discharge from a starting level.
#[derive(Debug, Clone)]
pub struct SimulatedBattery {
    start_pct: f64,
    drain_pct_per_hour: f64,
    started: Instant,
}

impl SimulatedBattery {
    pub fn new(start_pct: f64, drain_pct_per_hour: f64) -> Self {
        Self {
            start_pct: start_pct.clamp(0.0, 100.0),
            drain_pct_per_hour: drain_pct_per_hour.max(0.0),
            started: Instant::now(),
        }
    }

    fn level_after(&self, hours: f64) -> f64 {
        (self.start_pct - self.drain_pct_per_hour * hours).clamp(0.0, 100.0)
    }
}

impl HealthProbe for SimulatedBattery {
    fn battery_pct(&self) -> Option<f64> {
        Some(self.level_after(self.started.elapsed().as_secs_f64() / 3600.0))
    }
}
