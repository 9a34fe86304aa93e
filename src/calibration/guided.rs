//! Guided tap calibration
//!
//! The operator taps the station a fixed number of times. Each tap is the run
//! of samples whose deviation magnitude stays above the acceptance threshold;
//! its peak is recorded when the magnitude falls back below. A tap window that
//! times out lowers the acceptance threshold by one step and re-arms, up to
//! `max_retries` times per tap.
//!
//! The procedure is a pure state machine fed one sample at a time, so the
//! detection engine owns the sensor and the tests own the clock.

use std::time::{Duration, Instant};

use super::CalibrationError;
use crate::config::GuidedConfig;

/// Outcome of a finished guided calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidedResult {
    /// Rest noise floor the taps were measured against (g)
    pub noise_floor_g: f64,
    /// Peak deviation of each recorded tap, in tap order (g)
    pub peaks_g: Vec<f64>,
    /// Weakest recorded tap (g)
    pub min_tap_g: f64,
    /// Recommended detection threshold (g)
    pub threshold_g: f64,
}

/// Progress reported after each sample.
#[derive(Debug, Clone, PartialEq)]
pub enum GuidedStep {
    /// Nothing changed that the operator needs to hear about
    Waiting,
    /// Tap `tap` (1-based) was recorded
    TapRecorded { tap: usize, peak_g: f64 },
    /// Tap window timed out; the acceptance threshold dropped
    ThresholdLowered { tap: usize, accept_g: f64, attempt: u32 },
    /// All taps recorded
    Done(GuidedResult),
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Armed { since: Instant },
    InTap { peak: f64 },
    Settling { until: Instant },
}

/// Guided calibration state machine.
#[derive(Debug)]
pub struct GuidedCalibration {
    taps: usize,
    tap_timeout: Duration,
    settle: Duration,
    step_g: f64,
    max_retries: u32,
    ratio: f64,
    noise_floor_g: f64,
    accept_g: f64,
    retries: u32,
    peaks: Vec<f64>,
    phase: Phase,
}

impl GuidedCalibration {
    /// Arm the first tap at `now`. The acceptance threshold starts
    /// `initial_accept_g` above the noise floor.
    pub fn new(config: &GuidedConfig, noise_floor_g: f64, now: Instant) -> Self {
        Self {
            taps: config.taps.max(1),
            tap_timeout: Duration::from_millis(config.tap_timeout_ms),
            settle: Duration::from_millis(config.tap_settle_ms),
            step_g: config.threshold_step_g,
            max_retries: config.max_retries,
            ratio: config.threshold_ratio,
            noise_floor_g,
            accept_g: noise_floor_g + config.initial_accept_g,
            retries: 0,
            peaks: Vec::with_capacity(config.taps),
            phase: Phase::Armed { since: now },
        }
    }

    /// Current acceptance threshold (g).
    pub fn accept_g(&self) -> f64 {
        self.accept_g
    }

    /// Taps recorded so far.
    pub fn recorded(&self) -> usize {
        self.peaks.len()
    }

    /// Feed one deviation magnitude sampled at `now`.
    pub fn observe(&mut self, magnitude_g: f64, now: Instant) -> Result<GuidedStep, CalibrationError> {
        match self.phase {
            Phase::Armed { since } => {
                if magnitude_g > self.accept_g {
                    self.phase = Phase::InTap { peak: magnitude_g };
                    return Ok(GuidedStep::Waiting);
                }
                if now.duration_since(since) < self.tap_timeout {
                    return Ok(GuidedStep::Waiting);
                }
                let tap = self.peaks.len() + 1;
                let lowered = self.accept_g - self.step_g;
                // Never accept rest noise as a tap
                if self.retries >= self.max_retries || lowered <= self.noise_floor_g {
                    return Err(CalibrationError::TapTimeout {
                        tap,
                        attempts: self.retries + 1,
                    });
                }
                self.retries += 1;
                self.accept_g = lowered;
                self.phase = Phase::Armed { since: now };
                Ok(GuidedStep::ThresholdLowered {
                    tap,
                    accept_g: lowered,
                    attempt: self.retries,
                })
            }
            Phase::InTap { peak } => {
                if magnitude_g > self.accept_g {
                    self.phase = Phase::InTap {
                        peak: peak.max(magnitude_g),
                    };
                    return Ok(GuidedStep::Waiting);
                }
                self.peaks.push(peak);
                self.retries = 0;
                let tap = self.peaks.len();
                if tap >= self.taps {
                    let threshold_g = recommend_threshold(self.noise_floor_g, &self.peaks, self.ratio)?;
                    return Ok(GuidedStep::Done(GuidedResult {
                        noise_floor_g: self.noise_floor_g,
                        min_tap_g: self.peaks.iter().copied().fold(f64::INFINITY, f64::min),
                        peaks_g: self.peaks.clone(),
                        threshold_g,
                    }));
                }
                self.phase = Phase::Settling {
                    until: now + self.settle,
                };
                Ok(GuidedStep::TapRecorded { tap, peak_g: peak })
            }
            Phase::Settling { until } => {
                if now >= until {
                    self.phase = Phase::Armed { since: now };
                }
                Ok(GuidedStep::Waiting)
            }
        }
    }
}

/// `baseline + ratio * (min_tap - baseline)`.
///
/// Biased toward the weakest tap so soft touches still register. Fails when
/// no tap rose above the baseline, which keeps the result strictly above it.
pub fn recommend_threshold(baseline_g: f64, peaks_g: &[f64], ratio: f64) -> Result<f64, CalibrationError> {
    let min_tap_g = peaks_g.iter().copied().fold(f64::INFINITY, f64::min);
    if !min_tap_g.is_finite() || min_tap_g <= baseline_g {
        return Err(CalibrationError::TapsBelowBaseline {
            min_tap_g,
            baseline_g,
        });
    }
    Ok(baseline_g + ratio * (min_tap_g - baseline_g))
}
