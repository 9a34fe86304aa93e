//! Local execution of assigned exercises

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::feedback::FeedbackController;
use crate::types::{ActionAssignment, ActionKind, FeedbackState, NodeId};

struct Running {
    assignment: ActionAssignment,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs at most one exercise at a time as a cancellable task.
pub struct ExerciseRunner {
    node_id: NodeId,
    feedback: Arc<FeedbackController>,
    touched: Arc<Notify>,
    running: Option<Running>,
    /// Last assignment id taken from an acknowledgement
    assigned_id: Option<u64>,
}

impl ExerciseRunner {
    pub fn new(node_id: impl Into<NodeId>, feedback: Arc<FeedbackController>) -> Self {
        Self {
            node_id: node_id.into(),
            feedback,
            touched: Arc::new(Notify::new()),
            running: None,
            assigned_id: None,
        }
    }

    /// Reconcile with the assignment carried in an acknowledgement.
    ///
    /// A new id starts its exercise; the same id again is a repeat and is
    /// ignored, even if the exercise already finished or was stopped; no
    /// assignment cancels whatever is running.
    pub fn apply(&mut self, assignment: Option<&ActionAssignment>) {
        match assignment {
            Some(a) if self.assigned_id != Some(a.id) => self.start(*a),
            Some(_) => {}
            None => {
                if self.assigned_id.take().is_some() {
                    self.cancel_running("assignment cleared");
                }
            }
        }
    }

    /// Explicit stop: cancel the exercise. The assignment id is kept so a
    /// repeated acknowledgement does not restart it.
    pub fn stop(&mut self) {
        self.cancel_running("stop command");
    }

    /// Exercise still executing, if any.
    pub fn current(&mut self) -> Option<ActionAssignment> {
        if self.running.as_ref().is_some_and(|r| r.task.is_finished()) {
            self.running = None;
        }
        self.running.as_ref().map(|r| r.assignment)
    }

    /// Forward a local touch to a waiting `touch` exercise.
    pub fn on_touch(&self) {
        self.touched.notify_waiters();
    }

    fn start(&mut self, assignment: ActionAssignment) {
        self.cancel_running("superseded");
        self.assigned_id = Some(assignment.id);
        info!(node = %self.node_id, id = assignment.id, kind = %assignment.kind, "Starting exercise");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_exercise(
            assignment.kind,
            Arc::clone(&self.feedback),
            Arc::clone(&self.touched),
            cancel.clone(),
        ));
        self.running = Some(Running {
            assignment,
            cancel,
            task,
        });
    }

    fn cancel_running(&mut self, reason: &str) {
        if let Some(running) = self.running.take() {
            debug!(node = %self.node_id, id = running.assignment.id, reason, "Cancelling exercise");
            running.cancel.cancel();
        }
    }
}

impl Drop for ExerciseRunner {
    fn drop(&mut self) {
        self.cancel_running("shutdown");
    }
}

async fn run_exercise(
    kind: ActionKind,
    feedback: Arc<FeedbackController>,
    touched: Arc<Notify>,
    cancel: CancellationToken,
) {
    match kind {
        ActionKind::Standby => feedback.set_state(FeedbackState::Standby),
        ActionKind::Touch => {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = touched.notified() => feedback.set_state(FeedbackState::Success),
            }
        }
        ActionKind::Timed { duration_ms } => {
            feedback.set_state(FeedbackState::Active);
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    feedback.set_state(FeedbackState::Standby);
                }
            }
        }
    }
}
