//! Node Registry - coordinator-side table of every node
//!
//! The single source of truth for "is this node alive, and what did it last
//! report". Heartbeat ingestion upserts the reporting node and builds its
//! acknowledgement under one table-wide lock; the orchestrator writes intent
//! (assignments, feedback, commands) through the same lock, and the next
//! acknowledgement carries it out.

mod record;

pub use record::NodeRecord;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{defaults, CoordinatorConfig};
use crate::protocol::{HeartbeatRequest, HeartbeatResponse, IDLE_STATUS};
use crate::types::{ActionAssignment, ActionKind, Command, FeedbackCommand, FeedbackState, NodeId, TouchEvent};

/// Result of ingesting one heartbeat.
#[derive(Debug, Clone)]
pub struct Ingested {
    /// Acknowledgement to write back
    pub response: HeartbeatResponse,
    /// Touches not seen before from this node, oldest first
    pub touches: Vec<TouchEvent>,
}

struct Table {
    nodes: HashMap<NodeId, NodeRecord>,
    drill_status: String,
    next_assignment_id: u64,
}

impl Table {
    fn node(&mut self, node_id: &str) -> &mut NodeRecord {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRecord::new(node_id))
    }
}

pub struct NodeRegistry {
    table: Mutex<Table>,
    offline_after: Duration,
    max_pending: usize,
}

impl NodeRegistry {
    pub fn new(offline_after: Duration) -> Self {
        Self {
            table: Mutex::new(Table {
                nodes: HashMap::new(),
                drill_status: IDLE_STATUS.to_string(),
                next_assignment_id: 1,
            }),
            offline_after,
            max_pending: defaults::MAX_PENDING_COMMANDS,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(Duration::from_millis(config.offline_after_ms))
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn offline_after(&self) -> Duration {
        self.offline_after
    }

    /// Upsert the reporting node and build its acknowledgement.
    ///
    /// Drains the node's pending commands into the response. Touches are
    /// filtered to ones newer than the last forwarded from this node, so a
    /// redelivered touch is returned at most once; test-mode touches are
    /// dropped.
    pub fn ingest(&self, request: &HeartbeatRequest, now: Instant) -> Ingested {
        let mut table = self.lock();
        let drill_status = table.drill_status.clone();
        let node = table.node(&request.node_id);

        if !node.online {
            if node.last_seen.is_some() {
                info!(node = %request.node_id, "🟢 Node back online");
            } else {
                info!(node = %request.node_id, status = %request.status, hops = request.hops, "🟢 Node joined");
            }
            node.online = true;
        }
        node.apply_report(request, now);

        let mut touches: Vec<TouchEvent> = request
            .touches
            .iter()
            .filter(|t| !t.test_mode)
            .cloned()
            .map(|mut t| {
                t.node_id = request.node_id.clone();
                t
            })
            .collect();
        touches.sort_by_key(|t| t.at);
        touches.retain(|t| node.last_touch_at.map_or(true, |last| t.at > last));
        if let Some(newest) = touches.last() {
            node.last_touch_at = Some(newest.at);
        }

        if node.assignment.is_some() && node.assignment_delivered.is_none() {
            node.assignment_delivered = Some(now);
        }
        let response = HeartbeatResponse {
            ack: true,
            assignment: node.assignment,
            drill_status,
            feedback: node.desired_feedback,
            commands: node.pending.drain(..).collect(),
        };
        debug!(
            node = %request.node_id,
            touches = touches.len(),
            commands = response.commands.len(),
            "Heartbeat ingested"
        );
        Ingested { response, touches }
    }

    /// Queue `command` for the node's next acknowledgement.
    ///
    /// Never blocks: when the queue is full the oldest command is dropped.
    pub fn send_to_node(&self, node_id: &str, command: Command) {
        let max_pending = self.max_pending;
        let mut table = self.lock();
        let node = table.node(node_id);
        if node.pending.len() >= max_pending {
            if let Some(dropped) = node.pending.pop_front() {
                warn!(node = %node_id, dropped = %dropped, "Command queue full, dropping oldest");
            }
        }
        debug!(node = %node_id, command = %command, "Command queued");
        node.pending.push_back(command);
    }

    /// Set the desired light state, stamped strictly newer than the last one.
    pub fn set_feedback_state(&self, node_id: &str, state: FeedbackState) {
        let mut table = self.lock();
        let node = table.node(node_id);
        let issued_at = next_issue_time(node.desired_feedback.map(|c| c.issued_at));
        node.desired_feedback = Some(FeedbackCommand::new(state, issued_at));
    }

    /// Assign an exercise; returns the assignment id.
    pub fn assign_action(&self, node_id: &str, kind: ActionKind) -> u64 {
        let mut table = self.lock();
        let id = table.next_assignment_id;
        table.next_assignment_id += 1;
        let node = table.node(node_id);
        node.assignment = Some(ActionAssignment {
            id,
            kind,
            assigned_at: Utc::now(),
        });
        node.assignment_delivered = None;
        id
    }

    pub fn clear_assignment(&self, node_id: &str) {
        if let Some(node) = self.lock().nodes.get_mut(node_id) {
            node.assignment = None;
            node.assignment_delivered = None;
        }
    }

    /// When the node's current assignment first went out in an
    /// acknowledgement; `None` while it is still undelivered.
    pub fn assignment_delivered_at(&self, node_id: &str) -> Option<Instant> {
        self.lock().nodes.get(node_id).and_then(|n| n.assignment_delivered)
    }

    pub fn set_drill_status(&self, status: impl Into<String>) {
        self.lock().drill_status = status.into();
    }

    pub fn drill_status(&self) -> String {
        self.lock().drill_status.clone()
    }

    /// Mark nodes silent for longer than the window offline.
    ///
    /// Returns the ids that went offline on this sweep.
    pub fn sweep(&self, now: Instant) -> Vec<NodeId> {
        let window = self.offline_after;
        let mut table = self.lock();
        let mut went_offline = Vec::new();
        for node in table.nodes.values_mut() {
            if node.online && node.is_stale(now, window) {
                node.online = false;
                warn!(
                    node = %node.node_id,
                    last_seen = ?node.last_seen_wall,
                    "🔴 Node offline (no heartbeat for {:?})", window
                );
                went_offline.push(node.node_id.clone());
            }
        }
        went_offline.sort();
        went_offline
    }

    pub fn is_online(&self, node_id: &str) -> bool {
        self.lock().nodes.get(node_id).is_some_and(|n| n.online)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.lock().nodes.get(node_id).cloned()
    }

    /// Copies of every record, sorted by node id.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }
}

fn next_issue_time(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

/// Background liveness sweep.
pub async fn run_liveness_sweep(registry: Arc<NodeRegistry>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        "Liveness sweep started (every {:?}, offline after {:?})",
        interval,
        registry.offline_after()
    );
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                registry.sweep(Instant::now());
            }
        }
    }
}
