//! Threshold + debounce touch detector

use std::time::{Duration, Instant};

use crate::calibration::CalibrationProfile;
use crate::types::Vector3;

/// Converts accelerometer samples into debounced touches.
#[derive(Debug, Clone)]
pub struct TouchDetector {
    baseline: Vector3,
    threshold_g: f64,
    debounce: Duration,
    last_touch: Option<Instant>,
}

impl TouchDetector {
    pub fn new(profile: &CalibrationProfile, debounce: Duration) -> Self {
        Self {
            baseline: profile.baseline,
            threshold_g: profile.threshold_g,
            debounce,
            last_touch: None,
        }
    }

    pub fn threshold_g(&self) -> f64 {
        self.threshold_g
    }

    pub fn baseline(&self) -> Vector3 {
        self.baseline
    }

    /// Take baseline and threshold from `profile`. The debounce window
    /// carries over.
    pub fn apply_profile(&mut self, profile: &CalibrationProfile) {
        self.baseline = profile.baseline;
        self.threshold_g = profile.threshold_g;
    }

    /// Euclidean deviation of `sample` from the baseline (g).
    pub fn deviation(&self, sample: &Vector3) -> f64 {
        sample.distance(&self.baseline)
    }

    /// Returns the deviation and whether a touch fired.
    ///
    /// A touch fires when the deviation exceeds the threshold and at least
    /// the debounce interval has passed since the last accepted touch.
    pub fn process(&mut self, sample: &Vector3, now: Instant) -> (f64, bool) {
        let magnitude = self.deviation(sample);
        if magnitude <= self.threshold_g {
            return (magnitude, false);
        }
        let debounced = self
            .last_touch
            .map_or(true, |last| now.saturating_duration_since(last) >= self.debounce);
        if debounced {
            self.last_touch = Some(now);
        }
        (magnitude, debounced)
    }
}
