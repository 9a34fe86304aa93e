//! Reaction Orchestrator - the drill state machine
//!
//! ```text
//! idle → countdown → awaiting_touch ⇄ advancing → complete | failed → (next run | idle)
//! ```
//!
//! One session at a time, guarded by one lock. Touch handling claims the
//! armed target (check and clear) inside a single critical section; only
//! then, with the lock released, does it act on the claim. A duplicate report
//! of the same touch therefore finds no target armed and is rejected.
//!
//! Timed steps (countdown ticks, the pause between runs, the optional
//! per-touch timeout) run as spawned tasks. Each carries a [`RunToken`] and
//! re-checks it under the lock, so a stopped or superseded session is never
//! touched by a stale task.
//!
//! Commands reach nodes through the [`NodeRegistry`] and are delivered in the
//! next heartbeat acknowledgement. Splits run on a drill clock that only
//! advances while the armed target is lit on its node: each segment starts
//! when the acknowledgement carrying the activation goes out. Run outcomes
//! are written to the [`RunStore`] from spawned tasks and never delay the
//! drill.

mod session;

pub use session::{
    permutation, Claim, DrillPhase, DrillSession, RejectReason, RunState, RunToken,
};

use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DrillConfig;
use crate::feedback::AudioSink;
use crate::protocol::IDLE_STATUS;
use crate::registry::NodeRegistry;
use crate::store::{RunRecord, RunStore, SegmentRecord, StoreError};
use crate::types::{ActionKind, AudioClip, Command, FeedbackState, NodeId, RunStatus, TouchEvent};

/// Drill orchestration errors
#[derive(Debug, Error)]
pub enum DrillError {
    #[error("A drill session is already active ({0})")]
    SessionActive(String),

    #[error("Invalid targets: {0}")]
    InvalidTargets(String),

    #[error("Session has no queued runs")]
    NoRuns,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of offering a touch to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchOutcome {
    Accepted { ordinal: u32 },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotActive,
}

/// Read-only view of the active session.
#[derive(Debug, Clone)]
pub struct DrillSnapshot {
    pub session_id: String,
    pub phase: DrillPhase,
    pub targets: Vec<NodeId>,
    pub run: Option<RunSnapshot>,
    pub queued: usize,
    pub finished: Vec<RunRecord>,
}

#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run_id: String,
    pub athlete: String,
    pub status: RunStatus,
    pub permutation: Vec<NodeId>,
    pub armed: Option<NodeId>,
    pub touches: u32,
    pub splits_ms: Vec<u64>,
    pub elapsed_ms: u64,
}

struct Shared {
    session: Mutex<Option<DrillSession>>,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn RunStore>,
    announcer: Arc<dyn AudioSink>,
    config: DrillConfig,
    coordinator_node: NodeId,
    next_epoch: AtomicU64,
}

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// `announcer` is the coordinator's own speaker (countdown, go, times).
    pub fn new(
        config: DrillConfig,
        coordinator_node: impl Into<NodeId>,
        registry: Arc<NodeRegistry>,
        store: Arc<dyn RunStore>,
        announcer: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(None),
                registry,
                store,
                announcer,
                config,
                coordinator_node: coordinator_node.into(),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<DrillSession>> {
        self.shared.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    // ========================================================================
    // Session start
    // ========================================================================

    /// Start a session with an explicit target set and roster.
    pub fn start_session(
        &self,
        session_id: impl Into<String>,
        targets: Vec<NodeId>,
        runs: Vec<RunRecord>,
    ) -> Result<(), DrillError> {
        let session_id = session_id.into();
        self.validate_targets(&targets)?;
        let runs: Vec<RunRecord> = runs
            .into_iter()
            .filter(|r| r.status == RunStatus::Queued)
            .collect();
        if runs.is_empty() {
            return Err(DrillError::NoRuns);
        }

        let mut guard = self.lock();
        if let Some(active) = guard.as_ref() {
            return Err(DrillError::SessionActive(active.id.clone()));
        }
        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::SeqCst);
        info!(
            session = %session_id,
            runs = runs.len(),
            targets = ?targets,
            "🏁 Drill session started"
        );
        let session = guard.insert(DrillSession::new(session_id, epoch, targets, runs));
        self.start_next_run(session);
        Ok(())
    }

    /// Start a stored session: targets come from its course, the roster
    /// from its queued runs.
    pub async fn start_session_by_id(&self, session_id: &str) -> Result<(), DrillError> {
        let store = &self.shared.store;
        let session = store.fetch_session(session_id).await?;
        let course = store.fetch_course(&session.course_id).await?;
        let mut runs = Vec::with_capacity(session.run_ids.len());
        for run_id in &session.run_ids {
            runs.push(store.fetch_run(run_id).await?);
        }
        let targets = course.target_nodes(&self.shared.coordinator_node);
        debug!(session = %session_id, course = %course.name, "Loaded session from {}", store.backend_name());
        self.start_session(session.id, targets, runs)
    }

    fn validate_targets(&self, targets: &[NodeId]) -> Result<(), DrillError> {
        let expected = self.shared.config.target_count;
        if targets.iter().any(|t| *t == self.shared.coordinator_node) {
            return Err(DrillError::InvalidTargets(format!(
                "the coordinator's own node '{}' cannot be a target",
                self.shared.coordinator_node
            )));
        }
        let distinct: HashSet<&NodeId> = targets.iter().collect();
        if distinct.len() != targets.len() {
            return Err(DrillError::InvalidTargets("duplicate target node".to_string()));
        }
        if targets.len() != expected {
            return Err(DrillError::InvalidTargets(format!(
                "expected exactly {expected} target nodes, got {}",
                targets.len()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Runs (all called with the session lock held)
    // ========================================================================

    /// Pop the next queued run and begin its countdown. False when none remain.
    fn start_next_run(&self, session: &mut DrillSession) -> bool {
        let Some(record) = session.queued.pop_front() else {
            return false;
        };
        let order = permutation(&session.targets, &mut rand::thread_rng());
        let run = RunState::new(record, order);
        info!(
            session = %session.id,
            run = %run.record.id,
            athlete = %run.record.athlete,
            order = ?run.permutation,
            "Run starting"
        );

        let registry = &self.shared.registry;
        for target in &session.targets {
            registry.clear_assignment(target);
            registry.set_feedback_state(target, FeedbackState::Off);
        }
        session.current = Some(run);
        session.phase = DrillPhase::Countdown;
        registry.set_drill_status(session.status_line());

        if let Some(token) = session.token() {
            let this = self.clone();
            tokio::spawn(async move { this.countdown(token).await });
        }
        true
    }

    async fn countdown(&self, token: RunToken) {
        let tick = Duration::from_millis(self.shared.config.countdown_tick_ms);
        for n in (1..=self.shared.config.countdown_ticks).rev() {
            if !self.still_counting(&token) {
                return;
            }
            self.shared.announcer.play(AudioClip::Countdown { n });
            tokio::time::sleep(tick).await;
        }

        let mut guard = self.lock();
        let Some(session) = guard.as_mut() else { return };
        if !session.matches(&token) || session.phase != DrillPhase::Countdown {
            return;
        }
        self.shared.announcer.play(AudioClip::Go);
        if let Some(run) = session.current.as_mut() {
            run.record.started_at = Some(Utc::now());
            info!(run = %run.record.id, athlete = %run.record.athlete, "🟢 Go");
            self.persist_run(run.record.clone());
        }
        self.activate_next(session);
    }

    fn still_counting(&self, token: &RunToken) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|s| s.matches(token) && s.phase == DrillPhase::Countdown)
    }

    /// Arm the next target in the permutation.
    fn activate_next(&self, session: &mut DrillSession) {
        let epoch = session.epoch;
        let Some(run) = session.current.as_mut() else { return };
        let Some(target) = run.next_target().cloned() else { return };

        let registry = &self.shared.registry;
        registry.assign_action(&target, ActionKind::Touch);
        registry.set_feedback_state(&target, FeedbackState::Active);
        registry.send_to_node(&target, Command::PlayAudio { clip: AudioClip::Beep });
        if !registry.is_online(&target) {
            warn!(run = %run.record.id, node = %target, "Armed target is offline, run waits for it");
        }

        run.armed = Some(target.clone());
        run.armed_at = Some(Instant::now());
        info!(
            run = %run.record.id,
            node = %target,
            ordinal = run.position + 1,
            "Target armed"
        );
        let token = RunToken {
            epoch,
            run_id: run.record.id.clone(),
            position: run.position,
        };
        session.phase = DrillPhase::AwaitingTouch;
        registry.set_drill_status(session.status_line());

        if let Some(timeout_ms) = self.shared.config.touch_timeout_ms {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                this.touch_timed_out(&token, &target);
            });
        }
    }

    fn touch_timed_out(&self, token: &RunToken, target: &str) {
        let mut guard = self.lock();
        let Some(session) = guard.as_mut() else { return };
        if !session.matches(token) || session.phase != DrillPhase::AwaitingTouch {
            return;
        }
        warn!(run = %token.run_id, node = %target, "Target not touched in time");
        let registry = &self.shared.registry;
        registry.clear_assignment(target);
        registry.set_feedback_state(target, FeedbackState::Off);
        self.shared.announcer.play(AudioClip::Stop);
        self.fail_run(session, "touch-timeout");
    }

    fn complete_run(&self, session: &mut DrillSession) {
        let Some(run) = session.current.as_mut() else { return };
        let elapsed_ms = run.clock_ms;
        run.record.status = RunStatus::Completed;
        run.record.finished_at = Some(Utc::now());
        run.record.elapsed_ms = Some(elapsed_ms);
        info!(
            run = %run.record.id,
            athlete = %run.record.athlete,
            elapsed_ms,
            splits_ms = ?run.splits_ms,
            "🏆 Run complete"
        );

        for target in &session.targets {
            self.shared.registry.set_feedback_state(target, FeedbackState::Success);
        }
        self.shared.announcer.play(AudioClip::Elapsed { millis: elapsed_ms });
        self.persist_run(run.record.clone());
        session.finished.push(run.record.clone());
        session.phase = DrillPhase::Complete;
        self.shared.registry.set_drill_status(session.status_line());
        self.schedule_next(session);
    }

    fn fail_run(&self, session: &mut DrillSession, reason: &str) {
        let Some(run) = session.current.as_mut() else { return };
        if run.record.status.is_terminal() {
            return;
        }
        run.armed = None;
        run.record.status = RunStatus::Failed;
        run.record.finished_at = Some(Utc::now());
        run.record.failure = Some(reason.to_string());
        warn!(run = %run.record.id, athlete = %run.record.athlete, touches = run.touches, reason, "Run failed");
        self.persist_run(run.record.clone());
        session.finished.push(run.record.clone());
        session.phase = DrillPhase::Failed;
        self.shared.registry.set_drill_status(session.status_line());
        self.schedule_next(session);
    }

    /// After the pause: next run, or end of session.
    fn schedule_next(&self, session: &DrillSession) {
        let Some(token) = session.token() else { return };
        let pause = Duration::from_millis(self.shared.config.inter_run_pause_ms);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(pause).await;
            this.advance_session(&token);
        });
    }

    fn advance_session(&self, token: &RunToken) {
        let mut guard = self.lock();
        let Some(session) = guard.as_mut() else { return };
        if !session.matches(token) || !matches!(session.phase, DrillPhase::Complete | DrillPhase::Failed) {
            return;
        }
        if self.start_next_run(session) {
            return;
        }
        if let Some(session) = guard.take() {
            info!(session = %session.id, runs = session.finished.len(), "Drill session complete");
            self.reset_nodes(&session, false);
        }
    }

    /// Clear assignments and return every known node to standby.
    fn reset_nodes(&self, session: &DrillSession, send_stop: bool) {
        let registry = &self.shared.registry;
        let nodes: BTreeSet<NodeId> = registry
            .snapshot()
            .into_iter()
            .map(|n| n.node_id)
            .chain(session.targets.iter().cloned())
            .chain(std::iter::once(self.shared.coordinator_node.clone()))
            .collect();
        for node in &nodes {
            if send_stop {
                registry.send_to_node(node, Command::Stop);
            }
            registry.clear_assignment(node);
            registry.set_feedback_state(node, FeedbackState::Standby);
        }
        registry.set_drill_status(IDLE_STATUS);
    }

    fn persist_run(&self, record: RunRecord) {
        let store = Arc::clone(&self.shared.store);
        tokio::spawn(async move {
            if let Err(e) = store.update_run(&record).await {
                warn!(run = %record.id, error = %e, "Failed to record run outcome");
            }
        });
    }

    // ========================================================================
    // Touches
    // ========================================================================

    /// Offer a touch. Accepted iff it names the armed target of a running run.
    pub fn handle_touch(&self, touch: &TouchEvent) -> TouchOutcome {
        let now = Instant::now();
        let claim = {
            let mut guard = self.lock();
            let Some(session) = guard.as_mut() else {
                return self.rejected(touch, RejectReason::NoSession);
            };
            let delivered = self.shared.registry.assignment_delivered_at(&touch.node_id);
            match session.claim(&touch.node_id, now, delivered) {
                Ok(claim) => claim,
                Err(reason) => {
                    drop(guard);
                    return self.rejected(touch, reason);
                }
            }
        };

        // Act on the claim with the lock released
        let segment = SegmentRecord {
            run_id: claim.token.run_id.clone(),
            ordinal: claim.ordinal,
            node_id: claim.node_id.clone(),
            split_ms: claim.split_ms,
            magnitude_g: touch.magnitude_g,
            recorded_at: Utc::now(),
        };
        let store = Arc::clone(&self.shared.store);
        tokio::spawn(async move {
            if let Err(e) = store.append_segment(&segment).await {
                warn!(run = %segment.run_id, ordinal = segment.ordinal, error = %e, "Failed to record segment");
            }
        });
        info!(
            run = %claim.token.run_id,
            node = %claim.node_id,
            ordinal = claim.ordinal,
            split_ms = claim.split_ms,
            "✅ Touch accepted"
        );

        let mut guard = self.lock();
        if let Some(session) = guard.as_mut() {
            // A stop in between has already reset the nodes
            if session.matches(&claim.token) && session.phase == DrillPhase::Advancing {
                let registry = &self.shared.registry;
                registry.set_feedback_state(&claim.node_id, FeedbackState::Off);
                registry.clear_assignment(&claim.node_id);
                let target_count = session.targets.len() as u32;
                if let Some(run) = session.current.as_mut() {
                    run.touches += 1;
                    run.position += 1;
                    run.splits_ms.push(claim.split_ms);
                }
                let done = session.current.as_ref().is_some_and(|r| r.touches >= target_count);
                if done {
                    self.complete_run(session);
                } else {
                    self.activate_next(session);
                }
            }
        }
        TouchOutcome::Accepted { ordinal: claim.ordinal }
    }

    fn rejected(&self, touch: &TouchEvent, reason: RejectReason) -> TouchOutcome {
        match &reason {
            RejectReason::WrongNode { armed } => {
                info!(node = %touch.node_id, armed = %armed, "Touch rejected: wrong node");
            }
            RejectReason::NoSession => debug!(node = %touch.node_id, "Touch outside a drill"),
            other => info!(node = %touch.node_id, reason = %other, "Touch rejected"),
        }
        TouchOutcome::Rejected(reason)
    }

    // ========================================================================
    // Stop / status
    // ========================================================================

    /// Operator stop. Idempotent; safe alongside an in-flight touch claim.
    pub fn stop(&self) -> StopOutcome {
        let Some(mut session) = self.lock().take() else {
            return StopOutcome::NotActive;
        };
        if let Some(run) = session.current.as_mut() {
            if !run.record.status.is_terminal() {
                run.armed = None;
                run.record.status = RunStatus::Failed;
                run.record.finished_at = Some(Utc::now());
                run.record.failure = Some("stopped".to_string());
                self.persist_run(run.record.clone());
            }
        }
        self.shared.announcer.play(AudioClip::Stop);
        self.reset_nodes(&session, true);
        warn!(session = %session.id, "🛑 Drill session stopped");
        StopOutcome::Stopped
    }

    pub fn snapshot(&self) -> Option<DrillSnapshot> {
        let now = Instant::now();
        let registry = &self.shared.registry;
        self.lock().as_ref().map(|session| DrillSnapshot {
            session_id: session.id.clone(),
            phase: session.phase,
            targets: session.targets.clone(),
            run: session.current.as_ref().map(|run| RunSnapshot {
                run_id: run.record.id.clone(),
                athlete: run.record.athlete.clone(),
                status: run.record.status,
                permutation: run.permutation.clone(),
                armed: run.armed.clone(),
                touches: run.touches,
                splits_ms: run.splits_ms.clone(),
                elapsed_ms: run.record.elapsed_ms.unwrap_or_else(|| {
                    let delivered = run.armed.as_ref().and_then(|n| registry.assignment_delivered_at(n));
                    run.elapsed_ms(now, delivered)
                }),
            }),
            queued: session.queued.len(),
            finished: session.finished.clone(),
        })
    }
}

/// Feed touches from the heartbeat server into the orchestrator.
pub async fn run_touch_consumer(
    orchestrator: Orchestrator,
    mut touches: mpsc::Receiver<TouchEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            touch = touches.recv() => match touch {
                Some(touch) => {
                    orchestrator.handle_touch(&touch);
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::LogAudio;
    use crate::protocol::HeartbeatRequest;
    use crate::store::MemoryRunStore;

    fn config() -> DrillConfig {
        DrillConfig {
            countdown_ticks: 3,
            countdown_tick_ms: 1_000,
            target_count: 5,
            touch_timeout_ms: None,
            inter_run_pause_ms: 2_000,
        }
    }

    fn targets() -> Vec<NodeId> {
        (1..=5).map(|i| format!("cone-{i}")).collect()
    }

    fn orchestrator(config: DrillConfig) -> (Orchestrator, Arc<NodeRegistry>, Arc<MemoryRunStore>) {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(10)));
        let store = Arc::new(MemoryRunStore::new());
        let orch = Orchestrator::new(
            config,
            "coordinator",
            Arc::clone(&registry),
            store.clone(),
            Arc::new(LogAudio::new("coordinator")),
        );
        (orch, registry, store)
    }

    fn touch(node: &str) -> TouchEvent {
        TouchEvent::new(node, Utc::now(), 0.8)
    }

    fn armed(orch: &Orchestrator) -> Option<NodeId> {
        orch.snapshot().and_then(|s| s.run).and_then(|r| r.armed)
    }

    fn desired(registry: &NodeRegistry, node: &str) -> Option<FeedbackState> {
        registry.get(node).and_then(|n| n.desired_feedback).map(|f| f.state)
    }

    #[test]
    fn test_start_rejects_bad_target_sets() {
        let (orch, _registry, _store) = orchestrator(config());
        let run = || vec![RunRecord::queued("r1", "s1", "Ana")];

        let four: Vec<NodeId> = targets().into_iter().take(4).collect();
        assert!(matches!(orch.start_session("s1", four, run()), Err(DrillError::InvalidTargets(_))));

        let mut with_coordinator = targets();
        with_coordinator[4] = "coordinator".into();
        assert!(matches!(
            orch.start_session("s1", with_coordinator, run()),
            Err(DrillError::InvalidTargets(_))
        ));

        let mut duplicate = targets();
        duplicate[4] = "cone-1".into();
        assert!(matches!(orch.start_session("s1", duplicate, run()), Err(DrillError::InvalidTargets(_))));

        assert!(matches!(orch.start_session("s1", targets(), Vec::new()), Err(DrillError::NoRuns)));
        assert!(!orch.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_rejected() {
        let (orch, _registry, _store) = orchestrator(config());
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        assert!(matches!(
            orch.start_session("s2", targets(), vec![RunRecord::queued("r2", "s2", "Ben")]),
            Err(DrillError::SessionActive(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_forces_targets_off_then_arms_first() {
        let (orch, registry, _store) = orchestrator(config());
        for target in targets() {
            registry.set_feedback_state(&target, FeedbackState::Standby);
        }
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();

        for target in targets() {
            assert_eq!(desired(&registry, &target), Some(FeedbackState::Off));
        }
        assert_eq!(orch.snapshot().unwrap().phase, DrillPhase::Countdown);
        assert_eq!(orch.handle_touch(&touch("cone-1")), TouchOutcome::Rejected(RejectReason::NoTargetArmed));

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let snapshot = orch.snapshot().unwrap();
        assert_eq!(snapshot.phase, DrillPhase::AwaitingTouch);
        let run = snapshot.run.unwrap();
        let first = run.armed.clone().unwrap();
        assert_eq!(first, run.permutation[0]);
        assert_eq!(desired(&registry, &first), Some(FeedbackState::Active));
        assert!(registry.get(&first).unwrap().assignment.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touches_in_order_complete_the_run() {
        let (orch, registry, store) = orchestrator(config());
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        for ordinal in 1..=5 {
            let node = armed(&orch).unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(orch.handle_touch(&touch(&node)), TouchOutcome::Accepted { ordinal });
            assert_eq!(registry.get(&node).unwrap().assignment, None);
        }

        let snapshot = orch.snapshot().unwrap();
        assert_eq!(snapshot.phase, DrillPhase::Complete);
        let run = snapshot.run.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.touches, 5);
        assert_eq!(run.elapsed_ms, 2_100);
        for target in targets() {
            assert_eq!(desired(&registry, &target), Some(FeedbackState::Success));
        }

        // Last run: after the pause the session ends and nodes stand by
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(!orch.is_active());
        assert_eq!(registry.drill_status(), "idle");
        for target in targets() {
            assert_eq!(desired(&registry, &target), Some(FeedbackState::Standby));
        }

        let record = store.fetch_run("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.elapsed_ms, Some(2_100));
        // "go" at 3.0 s, touches every 400 ms from 3.5 s
        let segments = store.segments_for_run("r1").await.unwrap();
        assert_eq!(
            segments.iter().map(|s| s.split_ms).collect::<Vec<_>>(),
            vec![500, 900, 1_300, 1_700, 2_100]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_touch_rejected_and_run_stalls() {
        let (orch, _registry, _store) = orchestrator(config());
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        let permutation = orch.snapshot().unwrap().run.unwrap().permutation;
        let outcome = orch.handle_touch(&touch(&permutation[2]));
        assert_eq!(
            outcome,
            TouchOutcome::Rejected(RejectReason::WrongNode { armed: permutation[0].clone() })
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        let run = orch.snapshot().unwrap().run.unwrap();
        assert_eq!(run.touches, 0);
        assert_eq!(run.armed.as_ref(), Some(&permutation[0]));
        assert_eq!(orch.handle_touch(&touch(&permutation[0])), TouchOutcome::Accepted { ordinal: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_touch_counted_once() {
        let (orch, _registry, _store) = orchestrator(config());
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        let first = armed(&orch).unwrap();
        let event = touch(&first);
        assert_eq!(orch.handle_touch(&event), TouchOutcome::Accepted { ordinal: 1 });
        assert!(matches!(orch.handle_touch(&event), TouchOutcome::Rejected(_)));
        assert_eq!(orch.snapshot().unwrap().run.unwrap().touches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_fails_run() {
        let (orch, registry, store) = orchestrator(config());
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let first = armed(&orch).unwrap();

        assert_eq!(orch.stop(), StopOutcome::Stopped);
        assert_eq!(orch.stop(), StopOutcome::NotActive);
        assert_eq!(
            orch.handle_touch(&touch(&first)),
            TouchOutcome::Rejected(RejectReason::NoSession)
        );

        let node = registry.get(&first).unwrap();
        assert!(node.pending.contains(&Command::Stop));
        assert_eq!(node.assignment, None);
        assert_eq!(desired(&registry, &first), Some(FeedbackState::Standby));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = store.fetch_run("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("stopped"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_stop_reaches_every_node() {
        let (orch, registry, _store) = orchestrator(config());
        for node in ["coordinator", "cone-9"] {
            registry.ingest(&HeartbeatRequest::new(node), Instant::now());
        }
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        orch.stop();

        let nodes = registry.snapshot();
        assert_eq!(nodes.len(), 7);
        for node in nodes {
            assert!(node.pending.contains(&Command::Stop), "{} got no stop", node.node_id);
            assert_eq!(node.assignment, None);
            assert_eq!(node.desired_feedback.map(|f| f.state), Some(FeedbackState::Standby));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_starts_when_activation_is_delivered() {
        let (orch, registry, store) = orchestrator(config());
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let first = armed(&orch).unwrap();

        // The node's next heartbeat comes 2.4 s after arming
        tokio::time::sleep(Duration::from_millis(2_300)).await;
        let ack = registry.ingest(&HeartbeatRequest::new(first.clone()), Instant::now()).response;
        assert!(ack.assignment.is_some());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(orch.snapshot().unwrap().run.unwrap().elapsed_ms, 350);
        assert_eq!(orch.handle_touch(&touch(&first)), TouchOutcome::Accepted { ordinal: 1 });

        // Undelivered activation: measured from arming
        let second = armed(&orch).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        orch.handle_touch(&touch(&second));

        let run = orch.snapshot().unwrap().run.unwrap();
        assert_eq!(run.splits_ms, vec![350, 850]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let segments = store.segments_for_run("r1").await.unwrap();
        assert_eq!(segments.iter().map(|s| s.split_ms).collect::<Vec<_>>(), vec![350, 850]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_armed_target_stalls_until_stop() {
        let (orch, registry, store) = orchestrator(config());
        for node in targets() {
            registry.ingest(&HeartbeatRequest::new(node), Instant::now());
        }
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let first = armed(&orch).unwrap();

        // The armed target goes silent, everyone else keeps reporting
        for _ in 0..11 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            for node in targets().into_iter().filter(|n| *n != first) {
                registry.ingest(&HeartbeatRequest::new(node), Instant::now());
            }
        }
        assert_eq!(registry.sweep(Instant::now()), vec![first.clone()]);
        assert!(!registry.is_online(&first));

        for node in targets().into_iter().filter(|n| *n != first) {
            assert_eq!(
                orch.handle_touch(&touch(&node)),
                TouchOutcome::Rejected(RejectReason::WrongNode { armed: first.clone() })
            );
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        let snapshot = orch.snapshot().unwrap();
        assert_eq!(snapshot.phase, DrillPhase::AwaitingTouch);
        let run = snapshot.run.unwrap();
        assert_eq!(run.touches, 0);
        assert_eq!(run.armed.as_ref(), Some(&first));
        assert_eq!(run.status, RunStatus::Running);

        assert_eq!(orch.stop(), StopOutcome::Stopped);
        assert!(registry.get(&first).unwrap().pending.contains(&Command::Stop));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = store.fetch_run("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("stopped"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_racing_touch_leaves_nothing_armed() {
        let mut cfg = config();
        cfg.countdown_ticks = 0;

        for round in 0..50 {
            let (orch, registry, store) = orchestrator(cfg.clone());
            orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
            let mut target = None;
            while target.is_none() {
                tokio::task::yield_now().await;
                target = armed(&orch);
            }
            let target = target.unwrap();
            // Let the "go" write land first
            tokio::time::sleep(Duration::from_millis(5)).await;

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let stopper = {
                let (orch, barrier) = (orch.clone(), Arc::clone(&barrier));
                tokio::spawn(async move {
                    barrier.wait().await;
                    orch.stop()
                })
            };
            let toucher = {
                let (orch, barrier, event) = (orch.clone(), Arc::clone(&barrier), touch(&target));
                tokio::spawn(async move {
                    barrier.wait().await;
                    orch.handle_touch(&event)
                })
            };
            assert_eq!(stopper.await.unwrap(), StopOutcome::Stopped, "round {round}");
            let outcome = toucher.await.unwrap();
            assert!(
                matches!(
                    outcome,
                    TouchOutcome::Accepted { ordinal: 1 } | TouchOutcome::Rejected(RejectReason::NoSession)
                ),
                "round {round}: {outcome:?}"
            );

            assert!(orch.snapshot().is_none(), "round {round}: session left behind");
            for node in targets() {
                let record = registry.get(&node).unwrap();
                assert_eq!(record.assignment, None, "round {round}: {node} still assigned");
                assert_eq!(
                    record.desired_feedback.map(|f| f.state),
                    Some(FeedbackState::Standby),
                    "round {round}: {node}"
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            let segments = store.segments_for_run("r1").await.unwrap();
            assert!(segments.len() <= 1, "round {round}: touch counted {} times", segments.len());
            assert_eq!(store.fetch_run("r1").await.unwrap().status, RunStatus::Failed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_countdown_cancels_go() {
        let (orch, registry, _store) = orchestrator(config());
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        orch.stop();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!orch.is_active());
        for target in targets() {
            assert_eq!(registry.get(&target).unwrap().assignment, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_timeout_fails_run_and_advances() {
        let mut cfg = config();
        cfg.touch_timeout_ms = Some(4_000);
        let (orch, _registry, store) = orchestrator(cfg);
        let runs = vec![RunRecord::queued("r1", "s1", "Ana"), RunRecord::queued("r2", "s1", "Ben")];
        orch.start_session("s1", targets(), runs).unwrap();

        tokio::time::sleep(Duration::from_millis(3_100 + 4_000)).await;
        let snapshot = orch.snapshot().unwrap();
        assert_eq!(snapshot.phase, DrillPhase::Failed);
        assert_eq!(snapshot.finished[0].failure.as_deref(), Some("touch-timeout"));

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let snapshot = orch.snapshot().unwrap();
        assert_eq!(snapshot.phase, DrillPhase::Countdown);
        assert_eq!(snapshot.run.unwrap().athlete, "Ben");
        assert_eq!(store.fetch_run("r1").await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_before_timeout_keeps_run_alive() {
        let mut cfg = config();
        cfg.touch_timeout_ms = Some(4_000);
        let (orch, _registry, _store) = orchestrator(cfg);
        orch.start_session("s1", targets(), vec![RunRecord::queued("r1", "s1", "Ana")]).unwrap();
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let first = armed(&orch).unwrap();
        orch.handle_touch(&touch(&first));

        // First target's timer fires here; the second target has its own
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let snapshot = orch.snapshot().unwrap();
        assert_eq!(snapshot.phase, DrillPhase::AwaitingTouch);
        assert_eq!(snapshot.run.unwrap().touches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_by_id_uses_course_targets() {
        use crate::store::{CourseAction, CourseDefinition, SessionRecord};

        let (orch, _registry, store) = orchestrator(config());
        let mut actions: Vec<CourseAction> = std::iter::once("coordinator".to_string())
            .chain(targets())
            .map(|node_id| CourseAction {
                node_id,
                kind: ActionKind::Touch,
                min_ms: None,
                max_ms: None,
                marks_completion: false,
            })
            .collect();
        actions[5].marks_completion = true;
        store.put_course(CourseDefinition {
            id: "reaction-5".into(),
            name: "Reaction".into(),
            actions,
        });
        store.put_run(RunRecord::queued("r1", "s9", "Ana"));
        let mut done = RunRecord::queued("r0", "s9", "Old");
        done.status = RunStatus::Completed;
        store.put_run(done);
        store.put_session(SessionRecord {
            id: "s9".into(),
            course_id: "reaction-5".into(),
            run_ids: vec!["r0".into(), "r1".into()],
            created_at: Utc::now(),
        });

        orch.start_session_by_id("s9").await.unwrap();
        let snapshot = orch.snapshot().unwrap();
        assert_eq!(snapshot.targets, targets());
        assert_eq!(snapshot.run.unwrap().athlete, "Ana");
        assert_eq!(snapshot.queued, 0);

        assert!(matches!(
            orch.start_session_by_id("missing").await,
            Err(DrillError::Store(StoreError::NotFound { .. }))
        ));
    }
}
