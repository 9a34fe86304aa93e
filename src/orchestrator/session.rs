//! Drill session and run state, mutated only under the orchestrator lock

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::store::RunRecord;
use crate::types::{NodeId, RunStatus};

/// Session state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrillPhase {
    /// Countdown ticks before "go", all targets off
    Countdown,
    /// One target armed, waiting for its touch
    AwaitingTouch,
    /// A touch was claimed; the next target is not armed yet
    Advancing,
    /// Run finished, pausing before the next run
    Complete,
    /// Run failed, pausing before the next run
    Failed,
}

impl std::fmt::Display for DrillPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrillPhase::Countdown => write!(f, "countdown"),
            DrillPhase::AwaitingTouch => write!(f, "awaiting_touch"),
            DrillPhase::Advancing => write!(f, "advancing"),
            DrillPhase::Complete => write!(f, "complete"),
            DrillPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Why a touch was not credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NoSession,
    NoRun,
    RunNotRunning(RunStatus),
    NoTargetArmed,
    WrongNode { armed: NodeId },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NoSession => write!(f, "no active session"),
            RejectReason::NoRun => write!(f, "no active run"),
            RejectReason::RunNotRunning(status) => write!(f, "run is {status}"),
            RejectReason::NoTargetArmed => write!(f, "no target armed"),
            RejectReason::WrongNode { armed } => write!(f, "wrong node (armed: {armed})"),
        }
    }
}

/// Identifies the state a spawned continuation was scheduled for.
///
/// A continuation acts only if the session still has the same epoch, the
/// same run, and the run is still at the same position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunToken {
    pub epoch: u64,
    pub run_id: String,
    pub position: usize,
}

/// A touch claimed against the armed target.
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: RunToken,
    pub node_id: NodeId,
    /// 1-based position of the touched target
    pub ordinal: u32,
    pub split_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub record: RunRecord,
    /// Target order, fixed before the run begins
    pub permutation: Vec<NodeId>,
    /// Index into `permutation` of the next target to touch
    pub position: usize,
    pub armed: Option<NodeId>,
    /// When the armed target was armed on the coordinator
    pub armed_at: Option<Instant>,
    pub touches: u32,
    /// Drill clock: reaction time summed over the targets touched so far
    pub clock_ms: u64,
    /// Drill clock reading at each touch
    pub splits_ms: Vec<u64>,
}

impl RunState {
    pub fn new(mut record: RunRecord, permutation: Vec<NodeId>) -> Self {
        record.status = RunStatus::Running;
        Self {
            record,
            permutation,
            position: 0,
            armed: None,
            armed_at: None,
            touches: 0,
            clock_ms: 0,
            splits_ms: Vec::new(),
        }
    }

    /// Time the athlete has had on the armed target.
    ///
    /// Counted from the later of arming and `delivered`, the instant the
    /// acknowledgement carrying the activation left the coordinator, so the
    /// wait for the node's next heartbeat is not charged to the athlete.
    pub fn segment_ms(&self, now: Instant, delivered: Option<Instant>) -> u64 {
        let Some(armed_at) = self.armed_at else {
            return 0;
        };
        let from = delivered.map_or(armed_at, |d| d.max(armed_at));
        now.saturating_duration_since(from).as_millis() as u64
    }

    /// Drill clock at `now`.
    pub fn elapsed_ms(&self, now: Instant, delivered: Option<Instant>) -> u64 {
        self.clock_ms + self.segment_ms(now, delivered)
    }

    pub fn next_target(&self) -> Option<&NodeId> {
        self.permutation.get(self.position)
    }
}

/// The one active drill.
#[derive(Debug)]
pub struct DrillSession {
    pub id: String,
    pub epoch: u64,
    /// Eligible target nodes, in definition order
    pub targets: Vec<NodeId>,
    pub queued: VecDeque<RunRecord>,
    pub current: Option<RunState>,
    pub phase: DrillPhase,
    pub finished: Vec<RunRecord>,
}

impl DrillSession {
    pub fn new(id: impl Into<String>, epoch: u64, targets: Vec<NodeId>, runs: Vec<RunRecord>) -> Self {
        Self {
            id: id.into(),
            epoch,
            targets,
            queued: runs.into(),
            current: None,
            phase: DrillPhase::Countdown,
            finished: Vec::new(),
        }
    }

    pub fn token(&self) -> Option<RunToken> {
        self.current.as_ref().map(|run| RunToken {
            epoch: self.epoch,
            run_id: run.record.id.clone(),
            position: run.position,
        })
    }

    pub fn matches(&self, token: &RunToken) -> bool {
        self.epoch == token.epoch
            && self
                .current
                .as_ref()
                .is_some_and(|run| run.record.id == token.run_id && run.position == token.position)
    }

    /// Atomically check the touch against the armed target and clear it.
    ///
    /// On success the session is left `Advancing` with nothing armed, so a
    /// duplicate report of the same touch is rejected. `delivered` is when
    /// the armed target's activation reached it, if known.
    pub fn claim(
        &mut self,
        node_id: &str,
        now: Instant,
        delivered: Option<Instant>,
    ) -> Result<Claim, RejectReason> {
        let epoch = self.epoch;
        let run = self.current.as_mut().ok_or(RejectReason::NoRun)?;
        if run.record.status != RunStatus::Running {
            return Err(RejectReason::RunNotRunning(run.record.status));
        }
        let armed = run.armed.as_ref().ok_or(RejectReason::NoTargetArmed)?;
        if armed != node_id {
            return Err(RejectReason::WrongNode { armed: armed.clone() });
        }

        let split_ms = run.elapsed_ms(now, delivered);
        run.armed = None;
        run.armed_at = None;
        run.clock_ms = split_ms;
        self.phase = DrillPhase::Advancing;
        Ok(Claim {
            token: RunToken {
                epoch,
                run_id: run.record.id.clone(),
                position: run.position,
            },
            node_id: node_id.to_string(),
            ordinal: run.position as u32 + 1,
            split_ms,
        })
    }

    /// Status string carried in every acknowledgement.
    pub fn status_line(&self) -> String {
        match &self.current {
            None => format!("session:{}", self.id),
            Some(run) => match self.phase {
                DrillPhase::Countdown => format!("countdown:{}", run.record.athlete),
                DrillPhase::AwaitingTouch | DrillPhase::Advancing => format!(
                    "running:{}:{}/{}",
                    run.record.athlete,
                    run.touches,
                    run.permutation.len()
                ),
                DrillPhase::Complete => format!(
                    "complete:{}:{}ms",
                    run.record.athlete,
                    run.record.elapsed_ms.unwrap_or_default()
                ),
                DrillPhase::Failed => format!("failed:{}", run.record.athlete),
            },
        }
    }
}

/// Uniform random order of `targets`, no repeats.
pub fn permutation<R: Rng + ?Sized>(targets: &[NodeId], rng: &mut R) -> Vec<NodeId> {
    let mut order = targets.to_vec();
    order.shuffle(rng);
    order
}
