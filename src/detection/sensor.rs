//! Motion sensor abstraction and the simulated accelerometer

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::calibration::SensorMode;
use crate::types::Vector3;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Sensor bus error: {0}")]
    Bus(String),

    #[error("Sensor not present at bus address {0:#04x}")]
    NotPresent(u8),
}

/// Ambient readings from the board's environment sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Environment {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
}

/// Accelerometer access.
///
/// Called only from the detection engine's sampling thread, so
/// implementations may block on bus I/O.
pub trait MotionSensor: Send + 'static {
    /// One three-axis reading in g.
    fn read_accel(&mut self) -> Result<Vector3, SensorError>;

    /// Temperature and humidity, where the board has them.
    fn read_environment(&mut self) -> Result<Environment, SensorError> {
        Ok(Environment::default())
    }

    /// Switch full-scale range.
    fn set_mode(&mut self, _mode: SensorMode) {}
}

impl MotionSensor for Box<dyn MotionSensor> {
    fn read_accel(&mut self) -> Result<Vector3, SensorError> {
        (**self).read_accel()
    }

    fn read_environment(&mut self) -> Result<Environment, SensorError> {
        (**self).read_environment()
    }

    fn set_mode(&mut self, mode: SensorMode) {
        (**self).set_mode(mode);
    }
}

// ============================================================================
// Simulated Sensor
// ============================================================================

/// Relative pulse shape of one simulated tap, one entry per sample.
const TAP_SHAPE: [f64; 6] = [0.35, 0.8, 1.0, 0.6, 0.25, 0.1];

/// Handle for injecting taps into a [`SimulatedSensor`] from another thread.
#[derive(Debug, Clone, Default)]
pub struct TapTrigger {
    pending: Arc<Mutex<VecDeque<f64>>>,
}

impl TapTrigger {
    /// Queue a tap peaking at `peak_g` above rest.
    pub fn tap(&self, peak_g: f64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push_back(peak_g);
    }

    fn next(&self) -> Option<f64> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.pop_front()
    }
}

/// Accelerometer at rest with Gaussian noise and injectable taps.
pub struct SimulatedSensor {
    rest: Vector3,
    noise_std_g: f64,
    mode: SensorMode,
    rng: StdRng,
    trigger: TapTrigger,
    pulse: Option<(f64, usize)>,
    temperature_c: f64,
}

impl SimulatedSensor {
    /// Sensor lying flat (1 g on z) with `noise_std_g` per-axis noise.
    pub fn new(noise_std_g: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            rest: Vector3::new(0.0, 0.0, 1.0),
            noise_std_g: noise_std_g.abs(),
            mode: SensorMode::default(),
            rng,
            trigger: TapTrigger::default(),
            pulse: None,
            temperature_c: 21.0,
        }
    }

    pub fn with_rest(mut self, rest: Vector3) -> Self {
        self.rest = rest;
        self
    }

    /// Trigger sharing this sensor's tap queue.
    pub fn trigger(&self) -> TapTrigger {
        self.trigger.clone()
    }

    fn noise(&mut self) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        z * self.noise_std_g
    }

    fn pulse_offset(&mut self) -> f64 {
        if self.pulse.is_none() {
            self.pulse = self.trigger.next().map(|peak| (peak, 0));
        }
        match self.pulse {
            Some((peak, i)) if i < TAP_SHAPE.len() => {
                self.pulse = Some((peak, i + 1));
                peak * TAP_SHAPE[i]
            }
            Some(_) => {
                self.pulse = None;
                0.0
            }
            None => 0.0,
        }
    }
}

impl MotionSensor for SimulatedSensor {
    fn read_accel(&mut self) -> Result<Vector3, SensorError> {
        let tap = self.pulse_offset();
        let reading = Vector3::new(
            self.rest.x + self.noise(),
            self.rest.y + self.noise(),
            self.rest.z + tap + self.noise(),
        );
        Ok(reading.clamp(self.mode.range_g()))
    }

    fn read_environment(&mut self) -> Result<Environment, SensorError> {
        self.temperature_c += self.noise() * 0.1;
        Ok(Environment {
            temperature_c: Some(self.temperature_c),
            humidity_pct: Some(45.0),
        })
    }

    fn set_mode(&mut self, mode: SensorMode) {
        self.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_noise_is_small() {
        let mut sensor = SimulatedSensor::new(0.01, Some(7));
        for _ in 0..500 {
            let s = sensor.read_accel().unwrap();
            assert!(s.distance(&Vector3::new(0.0, 0.0, 1.0)) < 0.1);
        }
    }

    #[test]
    fn test_tap_produces_pulse() {
        let mut sensor = SimulatedSensor::new(0.0, Some(1));
        sensor.trigger().tap(0.8);
        let peak = (0..10)
            .map(|_| sensor.read_accel().unwrap().z - 1.0)
            .fold(0.0_f64, f64::max);
        assert!((peak - 0.8).abs() < 1e-12);
        // Pulse is over
        assert_eq!(sensor.read_accel().unwrap().z, 1.0);
    }

    #[test]
    fn test_mode_clips_readings() {
        let mut sensor = SimulatedSensor::new(0.0, Some(1));
        sensor.set_mode(SensorMode::G2);
        sensor.trigger().tap(5.0);
        let max_z = (0..10)
            .map(|_| sensor.read_accel().unwrap().z)
            .fold(0.0_f64, f64::max);
        assert_eq!(max_z, 2.0);
    }
}
