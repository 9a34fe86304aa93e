//! Sampling thread and its control handle

use chrono::Utc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{DetectionError, MotionSensor, TouchDetector};
use crate::calibration::{
    auto_threshold, CalibrationError, CalibrationProfile, CalibrationStore, GuidedCalibration,
    GuidedResult, GuidedStep, RestAccumulator, RestBaseline, SensorMode,
};
use crate::config::{DetectionConfig, GuidedConfig, MeshConfig};
use crate::types::{NodeId, SensorSnapshot, TouchEvent};

/// Environment sensor is read once per this many samples.
const ENVIRONMENT_EVERY: u64 = 100;

/// Consecutive read errors before a warning is repeated.
const SENSOR_ERROR_LOG_EVERY: u64 = 500;

/// Everything the sampling thread needs to know about its station.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: NodeId,
    pub detection: DetectionConfig,
    pub guided: GuidedConfig,
    pub debounce: Duration,
    pub sensor_mode: SensorMode,
    pub g_force: bool,
    pub bus_address: u8,
}

impl EngineConfig {
    /// Engine settings for `node_id`, picking the debounce window that
    /// matches whether it is the coordinator's co-located station.
    pub fn from_mesh(config: &MeshConfig, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            detection: config.detection.clone(),
            guided: config.guided.clone(),
            debounce: config.debounce_for(node_id),
            sensor_mode: config.station.sensor_mode,
            g_force: config.station.g_force,
            bus_address: config.station.bus_address,
        }
    }
}

enum Control {
    SetThreshold {
        threshold_g: f64,
        reply: oneshot::Sender<Result<CalibrationProfile, CalibrationError>>,
    },
    Guided {
        reply: oneshot::Sender<Result<GuidedResult, CalibrationError>>,
    },
    TestMode {
        duration: Duration,
    },
    Shutdown,
}

/// Entry point for starting a station's detection thread.
pub struct DetectionEngine;

impl DetectionEngine {
    /// Spawn the sampling thread.
    ///
    /// Resolves once the thread has a usable profile: loaded from `store`, or
    /// measured by a one-off auto-calibration. If that calibration fails the
    /// thread exits, no touch is ever emitted, and the error is returned.
    pub async fn start<S: MotionSensor>(
        config: EngineConfig,
        mut sensor: S,
        store: CalibrationStore,
        touches: mpsc::Sender<TouchEvent>,
    ) -> Result<DetectionHandle, DetectionError> {
        let (control_tx, control_rx) = std_mpsc::channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SensorSnapshot::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        let node_id = config.node_id.clone();

        let thread = std::thread::Builder::new()
            .name(format!("detect-{node_id}"))
            .spawn(move || {
                sensor.set_mode(config.sensor_mode);
                let mut pacer = Pacer::new(config.detection.sample_interval());
                let profile = match initial_profile(&config, &mut sensor, &store, &mut pacer) {
                    Ok(p) => p,
                    Err(e) => {
                        error!(node = %config.node_id, error = %e, "Auto-calibration failed, detection not started");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(profile.clone()));
                let engine = Engine {
                    detector: TouchDetector::new(&profile, config.debounce),
                    config,
                    sensor,
                    store,
                    profile,
                    touches,
                    snapshot_tx,
                    control_rx,
                    pacer,
                    test_until: None,
                    deferred: Vec::new(),
                    stop: false,
                };
                engine.run();
            })?;

        match ready_rx.await {
            Ok(Ok(profile)) => {
                info!(
                    node = %node_id,
                    threshold_g = profile.threshold_g,
                    baseline = %profile.baseline,
                    "Touch detection running"
                );
                Ok(DetectionHandle {
                    node_id,
                    control: control_tx,
                    snapshot: snapshot_rx,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e.into())
            }
            Err(_) => {
                let _ = thread.join();
                Err(DetectionError::EngineStopped)
            }
        }
    }
}

/// Load a valid profile or auto-calibrate once.
fn initial_profile<S: MotionSensor>(
    config: &EngineConfig,
    sensor: &mut S,
    store: &CalibrationStore,
    pacer: &mut Pacer,
) -> Result<CalibrationProfile, CalibrationError> {
    if let Some(profile) = store.load(&config.node_id) {
        if profile.sensor_mode == config.sensor_mode {
            return Ok(profile);
        }
        warn!(
            node = %config.node_id,
            file_mode = %profile.sensor_mode,
            mode = %config.sensor_mode,
            "Calibration was taken in another sensor mode, recalibrating"
        );
    }

    info!(
        node = %config.node_id,
        rest_ms = config.detection.rest_duration_ms,
        "No valid calibration, measuring rest baseline"
    );
    let rest = measure_rest(config, sensor, pacer, || Ok(()))?;
    let threshold_g = auto_threshold(&rest, config.detection.default_threshold_g, config.detection.noise_sigma);
    let profile = CalibrationProfile::new(config.node_id.clone(), &rest, threshold_g, config.sensor_mode)
        .with_hardware(config.g_force, config.bus_address);
    info!(
        node = %config.node_id,
        samples = rest.samples,
        noise_floor_g = rest.noise_floor_g,
        threshold_g,
        "Auto-calibration complete"
    );
    if let Err(e) = store.save(&profile) {
        warn!(node = %config.node_id, error = %e, "Failed to persist auto-calibration");
    }
    Ok(profile)
}

/// Sample at rest for the configured window. `check` runs before every
/// sample and may abort the measurement.
fn measure_rest<S, F>(
    config: &EngineConfig,
    sensor: &mut S,
    pacer: &mut Pacer,
    mut check: F,
) -> Result<RestBaseline, CalibrationError>
where
    S: MotionSensor,
    F: FnMut() -> Result<(), CalibrationError>,
{
    let window = Duration::from_millis(config.detection.rest_duration_ms);
    let target = config.detection.samples_for(window);
    let mut acc = RestAccumulator::with_capacity(target);
    let mut failures = 0usize;
    pacer.reset();
    for _ in 0..target {
        check()?;
        match sensor.read_accel() {
            Ok(sample) => acc.add(sample),
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!(node = %config.node_id, error = %e, "Sensor read failed during rest measurement");
                }
            }
        }
        pacer.wait();
    }
    if failures > 0 {
        debug!(node = %config.node_id, failures, "Rest samples lost to read errors");
    }
    acc.finish(config.detection.min_rest_samples)
}

// ============================================================================
// Handle
// ============================================================================

/// Control handle for a running detection thread.
///
/// Dropping the handle stops and joins the thread.
pub struct DetectionHandle {
    node_id: NodeId,
    control: std_mpsc::Sender<Control>,
    snapshot: watch::Receiver<SensorSnapshot>,
    thread: Option<JoinHandle<()>>,
}

impl DetectionHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Latest published sensor snapshot.
    pub fn snapshot(&self) -> SensorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SensorSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Replace the live threshold and persist it.
    pub async fn set_threshold(&self, threshold_g: f64) -> Result<CalibrationProfile, DetectionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::SetThreshold { threshold_g, reply })?;
        Ok(rx.await.map_err(|_| DetectionError::EngineStopped)??)
    }

    /// Run the guided tap calibration. Detection pauses until it finishes.
    pub async fn guided(&self) -> Result<GuidedResult, DetectionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Guided { reply })?;
        Ok(rx.await.map_err(|_| DetectionError::EngineStopped)??)
    }

    /// Tag touches as test touches for `duration`.
    pub fn test_mode(&self, duration: Duration) -> Result<(), DetectionError> {
        self.send(Control::TestMode { duration })
    }

    /// Stop and join the sampling thread. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(node = %self.node_id, "Detection thread panicked");
            }
        }
    }

    fn send(&self, control: Control) -> Result<(), DetectionError> {
        self.control.send(control).map_err(|_| DetectionError::EngineStopped)
    }
}

impl Drop for DetectionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Sampling Thread
// ============================================================================

/// Fixed-rate sleep that does not drift with processing time.
struct Pacer {
    interval: Duration,
    next: Instant,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + interval,
        }
    }

    fn reset(&mut self) {
        self.next = Instant::now() + self.interval;
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
            self.next += self.interval;
        } else {
            // Fell behind; resynchronise rather than burst
            self.next = now + self.interval;
        }
    }
}

struct Engine<S: MotionSensor> {
    config: EngineConfig,
    sensor: S,
    store: CalibrationStore,
    detector: TouchDetector,
    profile: CalibrationProfile,
    touches: mpsc::Sender<TouchEvent>,
    snapshot_tx: watch::Sender<SensorSnapshot>,
    control_rx: std_mpsc::Receiver<Control>,
    pacer: Pacer,
    test_until: Option<Instant>,
    deferred: Vec<Control>,
    stop: bool,
}

impl<S: MotionSensor> Engine<S> {
    fn run(mut self) {
        let mut samples: u64 = 0;
        let mut read_errors: u64 = 0;
        let mut snapshot = SensorSnapshot {
            threshold_g: self.profile.threshold_g,
            ..SensorSnapshot::default()
        };
        self.pacer.reset();

        while !self.stop {
            self.drain_controls();
            if self.stop {
                break;
            }

            let now = Instant::now();
            let sample = match self.sensor.read_accel() {
                Ok(s) => {
                    read_errors = 0;
                    s
                }
                Err(e) => {
                    if read_errors % SENSOR_ERROR_LOG_EVERY == 0 {
                        warn!(node = %self.config.node_id, error = %e, "Accelerometer read failed");
                    }
                    read_errors += 1;
                    self.pacer.wait();
                    continue;
                }
            };

            let (magnitude, fired) = self.detector.process(&sample, now);
            if fired && !self.emit(magnitude, now) {
                break;
            }

            if samples % ENVIRONMENT_EVERY == 0 {
                if let Ok(env) = self.sensor.read_environment() {
                    snapshot.temperature_c = env.temperature_c;
                    snapshot.humidity_pct = env.humidity_pct;
                }
            }
            snapshot.accel = sample;
            snapshot.deviation_g = magnitude;
            snapshot.threshold_g = self.detector.threshold_g();
            self.snapshot_tx.send_replace(snapshot.clone());

            samples += 1;
            self.pacer.wait();
        }
        debug!(node = %self.config.node_id, samples, "Detection thread exiting");
    }

    /// Returns false when the touch receiver is gone.
    fn emit(&mut self, magnitude: f64, now: Instant) -> bool {
        let mut touch = TouchEvent::new(self.config.node_id.clone(), Utc::now(), magnitude);
        touch.test_mode = self.test_until.is_some_and(|until| now < until);
        debug!(node = %self.config.node_id, magnitude_g = magnitude, test = touch.test_mode, "Touch detected");
        match self.touches.try_send(touch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(node = %self.config.node_id, "Touch channel full, dropping touch");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!(node = %self.config.node_id, "Touch receiver closed, stopping detection");
                false
            }
        }
    }

    fn drain_controls(&mut self) {
        let mut pending: Vec<Control> = std::mem::take(&mut self.deferred);
        loop {
            match self.control_rx.try_recv() {
                Ok(c) => pending.push(c),
                Err(std_mpsc::TryRecvError::Empty) => break,
                Err(std_mpsc::TryRecvError::Disconnected) => {
                    self.stop = true;
                    break;
                }
            }
        }
        for control in pending {
            if self.stop {
                break;
            }
            self.apply(control);
        }
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::SetThreshold { threshold_g, reply } => {
                let _ = reply.send(self.set_threshold(threshold_g));
            }
            Control::Guided { reply } => {
                let result = self.run_guided();
                if let Err(e) = &result {
                    warn!(node = %self.config.node_id, error = %e, "Guided calibration failed");
                }
                let _ = reply.send(result);
                self.pacer.reset();
            }
            Control::TestMode { duration } => {
                info!(node = %self.config.node_id, duration_ms = duration.as_millis() as u64, "Test mode on");
                self.test_until = Some(Instant::now() + duration);
            }
            Control::Shutdown => self.stop = true,
        }
    }

    fn set_threshold(&mut self, threshold_g: f64) -> Result<CalibrationProfile, CalibrationError> {
        if !threshold_g.is_finite() || threshold_g <= self.profile.noise_floor_g {
            return Err(CalibrationError::ThresholdNotAboveFloor {
                threshold_g,
                noise_floor_g: self.profile.noise_floor_g,
            });
        }
        let profile = self.profile.with_threshold(threshold_g);
        self.commit(profile.clone());
        info!(node = %self.config.node_id, threshold_g, "Detection threshold updated");
        Ok(profile)
    }

    /// Apply to the live detector first, then persist.
    fn commit(&mut self, profile: CalibrationProfile) {
        self.detector.apply_profile(&profile);
        if let Err(e) = self.store.save(&profile) {
            warn!(node = %self.config.node_id, error = %e, "Failed to persist calibration profile");
        }
        self.profile = profile;
    }

    fn run_guided(&mut self) -> Result<GuidedResult, CalibrationError> {
        info!(node = %self.config.node_id, taps = self.config.guided.taps, "Guided calibration: hold still");

        let config = self.config.clone();
        let mut pacer = Pacer::new(self.pacer.interval);
        let rest = {
            let Engine { sensor, control_rx, deferred, stop, .. } = &mut *self;
            measure_rest(&config, sensor, &mut pacer, || poll_abort(control_rx, deferred, stop))?
        };
        info!(
            node = %self.config.node_id,
            noise_floor_g = rest.noise_floor_g,
            "Guided calibration: rest measured, tap the station"
        );

        let mut guided = GuidedCalibration::new(&self.config.guided, rest.noise_floor_g, Instant::now());
        // A sensor silent for a whole tap window is treated as dead
        let outage_limit = Duration::from_millis(self.config.guided.tap_timeout_ms);
        let mut read_errors: u64 = 0;
        let mut failing_since: Option<Instant> = None;
        pacer.reset();
        loop {
            poll_abort(&self.control_rx, &mut self.deferred, &mut self.stop)?;
            let sample = match self.sensor.read_accel() {
                Ok(sample) => {
                    failing_since = None;
                    sample
                }
                Err(e) => {
                    if read_errors % SENSOR_ERROR_LOG_EVERY == 0 {
                        warn!(node = %self.config.node_id, error = %e, "Sensor read failed during guided calibration");
                    }
                    read_errors += 1;
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > outage_limit {
                        return Err(CalibrationError::Sensor(e.to_string()));
                    }
                    pacer.wait();
                    continue;
                }
            };
            let now = Instant::now();
            match guided.observe(sample.distance(&rest.baseline), now)? {
                GuidedStep::Waiting => {}
                GuidedStep::TapRecorded { tap, peak_g } => {
                    info!(node = %self.config.node_id, tap, peak_g, "Guided calibration: tap recorded");
                }
                GuidedStep::ThresholdLowered { tap, accept_g, attempt } => {
                    warn!(
                        node = %self.config.node_id,
                        tap,
                        accept_g,
                        attempt,
                        "Guided calibration: no tap detected, lowering acceptance threshold"
                    );
                }
                GuidedStep::Done(result) => {
                    if read_errors > 0 {
                        debug!(node = %self.config.node_id, read_errors, "Guided samples lost to read errors");
                    }
                    let profile = CalibrationProfile::new(
                        self.config.node_id.clone(),
                        &rest,
                        result.threshold_g,
                        self.config.sensor_mode,
                    )
                    .with_hardware(self.config.g_force, self.config.bus_address);
                    self.commit(profile);
                    info!(
                        node = %self.config.node_id,
                        min_tap_g = result.min_tap_g,
                        threshold_g = result.threshold_g,
                        "Guided calibration complete"
                    );
                    return Ok(result);
                }
            }
            pacer.wait();
        }
    }
}

/// Shutdown aborts a calibration; other controls wait until it is over.
fn poll_abort(
    control_rx: &std_mpsc::Receiver<Control>,
    deferred: &mut Vec<Control>,
    stop: &mut bool,
) -> Result<(), CalibrationError> {
    loop {
        match control_rx.try_recv() {
            Ok(Control::Shutdown) | Err(std_mpsc::TryRecvError::Disconnected) => {
                *stop = true;
                return Err(CalibrationError::Aborted);
            }
            Ok(other) => deferred.push(other),
            Err(std_mpsc::TryRecvError::Empty) => return Ok(()),
        }
    }
}
