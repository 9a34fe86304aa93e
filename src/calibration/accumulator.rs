//! Rest baseline measurement

use super::CalibrationError;
use crate::types::Vector3;

/// Welford running mean and variance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Welford {
    pub count: usize,
    pub mean: f64,
    m2: f64,
}

impl Welford {
    /// Non-finite values are skipped; one NaN would poison mean and m2.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Result of a rest measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestBaseline {
    /// Mean rest reading per axis (g)
    pub baseline: Vector3,
    /// Mean deviation magnitude from `baseline` (g)
    pub noise_floor_g: f64,
    /// Standard deviation of the deviation magnitude (g)
    pub noise_std_g: f64,
    pub samples: usize,
}

/// Collects rest samples and reduces them to a [`RestBaseline`].
///
/// The baseline mean is tracked online; noise statistics need the final mean
/// so the raw window is kept until [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct RestAccumulator {
    x: Welford,
    y: Welford,
    z: Welford,
    samples: Vec<Vector3>,
}

impl RestAccumulator {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn add(&mut self, sample: Vector3) {
        if !sample.is_finite() {
            return;
        }
        self.x.add(sample.x);
        self.y.add(sample.y);
        self.z.add(sample.z);
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn finish(self, min_samples: usize) -> Result<RestBaseline, CalibrationError> {
        if self.samples.len() < min_samples.max(1) {
            return Err(CalibrationError::InsufficientSamples {
                collected: self.samples.len(),
                required: min_samples.max(1),
            });
        }
        let baseline = Vector3::new(self.x.mean, self.y.mean, self.z.mean);
        let mut deviation = Welford::default();
        for sample in &self.samples {
            deviation.add(sample.distance(&baseline));
        }
        Ok(RestBaseline {
            baseline,
            noise_floor_g: deviation.mean,
            noise_std_g: deviation.std_dev(),
            samples: self.samples.len(),
        })
    }
}

/// Automatic threshold: `max(default, noise_floor + sigma * noise_std)`,
/// always strictly above the noise floor.
pub fn auto_threshold(rest: &RestBaseline, default_threshold_g: f64, sigma: f64) -> f64 {
    let threshold = (rest.noise_floor_g + sigma * rest.noise_std_g).max(default_threshold_g);
    if threshold > rest.noise_floor_g {
        threshold
    } else {
        rest.noise_floor_g + default_threshold_g.abs().max(f64::EPSILON)
    }
}
