//! Node Link - station side of the heartbeat protocol
//!
//! One task per station. While connected it sends a heartbeat every
//! `heartbeat_interval_ms`, plus one immediately after each local touch, and
//! reads exactly one acknowledgement per heartbeat. While the coordinator
//! reports a drill in progress the interval drops to `drill_poll_ms`, so an
//! armed target lights within one poll rather than one heartbeat interval. Any send or receive
//! failure drops the connection and the link falls back to a fixed-delay
//! reconnect loop, showing `network-error` until it is back.
//!
//! Touches stay queued until a heartbeat carrying them is acknowledged, so a
//! touch can be delivered more than once. The coordinator's claim-then-act
//! rule makes redelivery harmless.

mod client;
mod exercise;
mod health;

pub use client::HeartbeatClient;
pub use exercise::ExerciseRunner;
pub use health::{HealthProbe, SimulatedBattery, LOW_BATTERY_PCT};

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::calibration::CalibrationStore;
use crate::config::{defaults, LinkConfig, MeshConfig};
use crate::detection::{DetectionEngine, DetectionHandle, EngineConfig, MotionSensor};
use crate::feedback::{AudioSink, FeedbackController, Indicator};
use crate::protocol::{HeartbeatRequest, HeartbeatResponse, ProtocolError};
use crate::types::{
    CalibrateOp, Command, FeedbackCommand, FeedbackState, NodeId, NodeStatus, TouchEvent,
};

/// Node link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Failed to start station component: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Why a connected session ended.
enum SessionEnd {
    Cancelled,
    Failed(LinkError),
}

/// Running station: link state plus the components it drives.
pub struct NodeLink {
    node_id: NodeId,
    hops: u8,
    config: LinkConfig,
    client: HeartbeatClient,
    feedback: Arc<FeedbackController>,
    audio: Arc<dyn AudioSink>,
    health: Box<dyn HealthProbe>,
    detection: Option<Arc<DetectionHandle>>,
    touches: mpsc::Receiver<TouchEvent>,
    touches_closed: bool,
    unacked: VecDeque<TouchEvent>,
    exercise: ExerciseRunner,
    last_feedback: Option<FeedbackCommand>,
    last_rtt_ms: Option<f64>,
    /// Last acknowledgement reported a drill in progress
    drill_active: bool,
    calibrating: Arc<AtomicBool>,
    /// Set after a guided calibration so the coordinator's desired state is
    /// applied again on the next acknowledgement
    refresh_feedback: Arc<AtomicBool>,
}

/// Components a [`NodeLink`] drives.
pub struct StationParts {
    pub feedback: Arc<FeedbackController>,
    pub audio: Arc<dyn AudioSink>,
    pub health: Box<dyn HealthProbe>,
    /// `None` when detection failed to start; the station reports `error`
    pub detection: Option<Arc<DetectionHandle>>,
    pub touches: mpsc::Receiver<TouchEvent>,
}

impl NodeLink {
    pub fn new(
        node_id: impl Into<NodeId>,
        coordinator_addr: &str,
        hops: u8,
        config: LinkConfig,
        parts: StationParts,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            client: HeartbeatClient::new(coordinator_addr, &config),
            exercise: ExerciseRunner::new(node_id.clone(), Arc::clone(&parts.feedback)),
            node_id,
            hops,
            config,
            feedback: parts.feedback,
            audio: parts.audio,
            health: parts.health,
            detection: parts.detection,
            touches: parts.touches,
            touches_closed: false,
            unacked: VecDeque::new(),
            last_feedback: None,
            last_rtt_ms: None,
            drill_active: false,
            calibrating: Arc::new(AtomicBool::new(false)),
            refresh_feedback: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Assemble one station: feedback render thread, detection engine
    /// (auto-calibrating if needed) and the link itself.
    ///
    /// A detection start failure is not fatal: the station still connects,
    /// shows `error` and reports status `error`.
    pub async fn start_station<S: MotionSensor, I: Indicator>(
        config: &MeshConfig,
        node_id: &str,
        coordinator_addr: &str,
        sensor: S,
        indicator: I,
        audio: Arc<dyn AudioSink>,
    ) -> Result<Self, LinkError> {
        let feedback = Arc::new(
            FeedbackController::start(node_id, config.feedback.clone(), indicator)
                .map_err(LinkError::Spawn)?,
        );

        let (touch_tx, touch_rx) = mpsc::channel(defaults::TOUCH_CHANNEL_CAPACITY);
        let store = CalibrationStore::new(&config.detection.calibration_dir);
        feedback.set_state(FeedbackState::Calibrating);
        let detection = match DetectionEngine::start(
            EngineConfig::from_mesh(config, node_id),
            sensor,
            store,
            touch_tx,
        )
        .await
        {
            Ok(handle) => {
                feedback.set_state(FeedbackState::Off);
                Some(Arc::new(handle))
            }
            Err(e) => {
                error!(node = %node_id, error = %e, "Detection not started");
                feedback.set_state(FeedbackState::Error);
                None
            }
        };

        let parts = StationParts {
            feedback,
            audio,
            health: Box::new(SimulatedBattery::new(
                config.station.battery_start_pct,
                config.station.battery_drain_pct_per_hour,
            )),
            detection,
            touches: touch_rx,
        };
        Ok(Self::new(
            node_id,
            coordinator_addr,
            config.station.hops,
            config.link.clone(),
            parts,
        ))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn feedback(&self) -> &Arc<FeedbackController> {
        &self.feedback
    }

    pub fn detection(&self) -> Option<&Arc<DetectionHandle>> {
        self.detection.as_ref()
    }

    /// Connect, heartbeat, reconnect; until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut failures: u32 = 0;
        info!(node = %self.node_id, coordinator = %self.client.addr(), "Node link started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.client.connect().await {
                Ok(()) => {
                    info!(node = %self.node_id, coordinator = %self.client.addr(), "🔗 Connected to coordinator");
                    failures = 0;
                    self.feedback.set_state(FeedbackState::Connected);
                    // The coordinator's desired state is applied again after the
                    // local `connected` indication
                    self.last_feedback = None;

                    match self.session(&cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(e) => {
                            warn!(node = %self.node_id, error = %e, "Heartbeat failed, reconnecting");
                        }
                    }
                    self.client.disconnect().await;
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!(node = %self.node_id, error = %e, "Coordinator unreachable, retrying every {:?}", retry_delay);
                    } else {
                        debug!(node = %self.node_id, error = %e, attempt = failures, "Reconnect failed");
                    }
                }
            }

            self.feedback.set_state(FeedbackState::NetworkError);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(retry_delay) => {}
            }
        }

        self.client.disconnect().await;
        self.exercise.stop();
        self.feedback.set_state(FeedbackState::Off);
        info!(node = %self.node_id, "Node link stopped");
    }

    async fn session(&mut self, cancel: &CancellationToken) -> SessionEnd {
        let mut next_beat = tokio::time::Instant::now();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                () = tokio::time::sleep_until(next_beat) => {}
                touch = self.touches.recv(), if !self.touches_closed => match touch {
                    Some(touch) => {
                        if !self.on_touch(touch) {
                            continue;
                        }
                        while let Ok(more) = self.touches.try_recv() {
                            self.on_touch(more);
                        }
                    }
                    None => {
                        debug!(node = %self.node_id, "Touch channel closed");
                        self.touches_closed = true;
                        continue;
                    }
                },
            }

            if let Err(e) = self.beat().await {
                return SessionEnd::Failed(e);
            }
            next_beat = tokio::time::Instant::now() + self.poll_interval();
        }
    }

    /// Delay until the next periodic heartbeat.
    fn poll_interval(&self) -> Duration {
        let ms = if self.drill_active {
            self.config.drill_poll_ms
        } else {
            self.config.heartbeat_interval_ms
        };
        Duration::from_millis(ms)
    }

    /// Handle a local touch. Returns true when it should be sent now.
    fn on_touch(&mut self, touch: TouchEvent) -> bool {
        self.exercise.on_touch();
        if touch.test_mode {
            info!(node = %self.node_id, magnitude_g = touch.magnitude_g, "Test touch");
            self.feedback.set_state(FeedbackState::Success);
            return false;
        }
        debug!(node = %self.node_id, magnitude_g = touch.magnitude_g, "Touch queued");
        if self.unacked.len() >= defaults::MAX_UNACKED_TOUCHES {
            if let Some(dropped) = self.unacked.pop_front() {
                warn!(node = %self.node_id, at = %dropped.at, "Unacknowledged touch queue full, dropping oldest");
            }
        }
        self.unacked.push_back(touch);
        true
    }

    /// One heartbeat exchange.
    async fn beat(&mut self) -> Result<(), LinkError> {
        let request = self.compose();
        let carried = request.touches.len();
        let started = Instant::now();

        let response = self.client.exchange(&request).await?;

        let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.last_rtt_ms = Some(rtt_ms);
        trace!(node = %self.node_id, rtt_ms, touches = carried, "Heartbeat acknowledged");

        let acked = carried.min(self.unacked.len());
        self.unacked.drain(..acked);
        self.handle_response(response);
        Ok(())
    }

    fn compose(&mut self) -> HeartbeatRequest {
        let detection_ok = self.detection.as_ref().is_some_and(|d| d.is_running());
        let current_action = self.exercise.current();
        let status = if self.calibrating.load(Ordering::SeqCst) {
            NodeStatus::Calibrating
        } else if !detection_ok {
            NodeStatus::Error
        } else if current_action.is_some() {
            NodeStatus::Busy
        } else {
            NodeStatus::Ready
        };

        HeartbeatRequest {
            node_id: self.node_id.clone(),
            status,
            rtt_ms: self.last_rtt_ms,
            hops: self.hops,
            sensor: self.detection.as_ref().map(|d| d.snapshot()).unwrap_or_default(),
            health: self.health.health(detection_ok),
            battery_pct: self.health.battery_pct(),
            current_action,
            touches: self.unacked.iter().cloned().collect(),
            feedback_state: self.feedback.get_state(),
            sent_at: Utc::now(),
        }
    }

    fn handle_response(&mut self, response: HeartbeatResponse) {
        if !response.ack {
            warn!(node = %self.node_id, "Heartbeat not acknowledged");
        }
        if self.refresh_feedback.swap(false, Ordering::SeqCst) {
            self.last_feedback = None;
        }
        let drill_active = response.drill_in_progress();
        if drill_active != self.drill_active {
            debug!(
                node = %self.node_id,
                status = %response.drill_status,
                "Drill polling {}",
                if drill_active { "on" } else { "off" }
            );
            self.drill_active = drill_active;
        }

        self.exercise.apply(response.assignment.as_ref());

        for command in response.commands {
            self.execute(command);
        }

        if let Some(cmd) = response.feedback {
            if cmd.supersedes(self.last_feedback.as_ref()) {
                debug!(node = %self.node_id, state = %cmd.state, "Applying feedback command");
                self.feedback.set_state(cmd.state);
                self.last_feedback = Some(cmd);
            }
        }
    }

    fn execute(&mut self, command: Command) {
        info!(node = %self.node_id, command = %command, "Command received");
        match command {
            Command::Stop => self.exercise.stop(),
            Command::PlayAudio { clip } => self.audio.play(clip),
            Command::Calibrate { op } => self.calibrate(op),
        }
    }

    fn calibrate(&mut self, op: CalibrateOp) {
        let Some(detection) = self.detection.clone() else {
            warn!(node = %self.node_id, op = %op, "Detection not running, calibrate ignored");
            return;
        };
        let node_id = self.node_id.clone();

        match op {
            CalibrateOp::SetThreshold { threshold_g } => {
                tokio::spawn(async move {
                    match detection.set_threshold(threshold_g).await {
                        Ok(profile) => info!(node = %node_id, threshold_g = profile.threshold_g, "Threshold updated"),
                        Err(e) => warn!(node = %node_id, threshold_g, error = %e, "Threshold rejected"),
                    }
                });
            }
            CalibrateOp::TestMode { duration_ms } => {
                if let Err(e) = detection.test_mode(Duration::from_millis(duration_ms)) {
                    warn!(node = %node_id, error = %e, "Test mode not started");
                }
            }
            CalibrateOp::Guided => {
                if self.calibrating.swap(true, Ordering::SeqCst) {
                    warn!(node = %node_id, "Guided calibration already running");
                    return;
                }
                let feedback = Arc::clone(&self.feedback);
                let calibrating = Arc::clone(&self.calibrating);
                let refresh = Arc::clone(&self.refresh_feedback);
                feedback.set_state(FeedbackState::Calibrating);
                tokio::spawn(async move {
                    match detection.guided().await {
                        Ok(result) => {
                            info!(
                                node = %node_id,
                                threshold_g = result.threshold_g,
                                min_tap_g = result.min_tap_g,
                                "✅ Guided calibration complete"
                            );
                            feedback.set_state(FeedbackState::Connected);
                            feedback.set_state(FeedbackState::Success);
                            refresh.store(true, Ordering::SeqCst);
                        }
                        Err(e) => {
                            warn!(node = %node_id, error = %e, "Guided calibration failed");
                            feedback.set_state(FeedbackState::Error);
                        }
                    }
                    calibrating.store(false, Ordering::SeqCst);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedbackConfig;
    use crate::feedback::{LogAudio, LogIndicator};
    use crate::types::{ActionAssignment, ActionKind, AudioClip};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAudio(Mutex<Vec<AudioClip>>);

    impl AudioSink for RecordingAudio {
        fn play(&self, clip: AudioClip) {
            self.0.lock().unwrap().push(clip);
        }
    }

    fn link_with(audio: Arc<dyn AudioSink>) -> (NodeLink, mpsc::Sender<TouchEvent>) {
        let feedback = Arc::new(
            FeedbackController::start("cone-1", FeedbackConfig::default(), LogIndicator::new("cone-1")).unwrap(),
        );
        let (tx, rx) = mpsc::channel(8);
        let parts = StationParts {
            feedback,
            audio,
            health: Box::new(SimulatedBattery::new(80.0, 0.0)),
            detection: None,
            touches: rx,
        };
        (NodeLink::new("cone-1", "127.0.0.1:1", 1, LinkConfig::default(), parts), tx)
    }

    fn ack() -> HeartbeatResponse {
        HeartbeatResponse {
            ack: true,
            ..HeartbeatResponse::default()
        }
    }

    #[tokio::test]
    async fn test_older_feedback_command_ignored() {
        let (mut link, _tx) = link_with(Arc::new(LogAudio::new("cone-1")));
        let now = Utc::now();

        let mut resp = ack();
        resp.feedback = Some(FeedbackCommand::new(FeedbackState::Armed, now));
        link.handle_response(resp);
        assert_eq!(link.feedback.get_state(), FeedbackState::Armed);

        link.feedback.set_state(FeedbackState::Active);
        // Repeated desired state is not applied again
        let mut repeat = ack();
        repeat.feedback = Some(FeedbackCommand::new(FeedbackState::Armed, now));
        link.handle_response(repeat);
        assert_eq!(link.feedback.get_state(), FeedbackState::Active);

        let mut older = ack();
        older.feedback = Some(FeedbackCommand::new(FeedbackState::Off, now - chrono::Duration::seconds(5)));
        link.handle_response(older);
        assert_eq!(link.feedback.get_state(), FeedbackState::Active);
    }

    #[tokio::test]
    async fn test_commands_are_executed() {
        let audio = Arc::new(RecordingAudio::default());
        let (mut link, _tx) = link_with(audio.clone());

        let mut resp = ack();
        resp.assignment = Some(ActionAssignment {
            id: 1,
            kind: ActionKind::Touch,
            assigned_at: Utc::now(),
        });
        resp.commands = vec![Command::PlayAudio { clip: AudioClip::Beep }];
        link.handle_response(resp);
        assert_eq!(audio.0.lock().unwrap().as_slice(), &[AudioClip::Beep]);
        assert!(link.exercise.current().is_some());

        let mut stop = ack();
        stop.commands = vec![Command::Stop];
        link.handle_response(stop);
        assert!(link.exercise.current().is_none());
    }

    #[tokio::test]
    async fn test_drill_in_progress_shortens_poll_interval() {
        let (mut link, _tx) = link_with(Arc::new(LogAudio::new("cone-1")));
        let idle = Duration::from_millis(link.config.heartbeat_interval_ms);
        let drill = Duration::from_millis(link.config.drill_poll_ms);
        assert!(drill < idle);
        assert_eq!(link.poll_interval(), idle);

        let mut running = ack();
        running.drill_status = "countdown:Ana".to_string();
        link.handle_response(running);
        assert_eq!(link.poll_interval(), drill);

        let mut done = ack();
        done.drill_status = "idle".to_string();
        link.handle_response(done);
        assert_eq!(link.poll_interval(), idle);
    }

    #[tokio::test]
    async fn test_touches_queue_until_acknowledged() {
        let (mut link, _tx) = link_with(Arc::new(LogAudio::new("cone-1")));
        let now = Utc::now();
        assert!(link.on_touch(TouchEvent::new("cone-1", now, 0.8)));

        let mut test_touch = TouchEvent::new("cone-1", now, 0.9);
        test_touch.test_mode = true;
        assert!(!link.on_touch(test_touch));

        let request = link.compose();
        assert_eq!(request.touches.len(), 1);
        assert_eq!(request.status, NodeStatus::Error);
        assert!(!request.health.sensor_ok);
    }

    #[tokio::test]
    async fn test_unacked_queue_is_bounded() {
        let (mut link, _tx) = link_with(Arc::new(LogAudio::new("cone-1")));
        let start = Utc::now();
        for i in 0..(defaults::MAX_UNACKED_TOUCHES + 3) {
            let at = start + chrono::Duration::milliseconds(i as i64);
            link.on_touch(TouchEvent::new("cone-1", at, 0.8));
        }
        assert_eq!(link.unacked.len(), defaults::MAX_UNACKED_TOUCHES);
        assert_eq!(link.unacked.front().map(|t| t.at), Some(start + chrono::Duration::milliseconds(3)));
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_shows_network_error() {
        let (link, _tx) = link_with(Arc::new(LogAudio::new("cone-1")));
        let feedback = Arc::clone(&link.feedback);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(link.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(feedback.get_state(), FeedbackState::NetworkError);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(feedback.get_state(), FeedbackState::Off);
    }
}
