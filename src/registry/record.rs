//! Per-node record held by the registry

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::protocol::HeartbeatRequest;
use crate::types::{
    ActionAssignment, Command, FeedbackCommand, FeedbackState, HardwareHealth, NodeId, NodeStatus,
    SensorSnapshot,
};

/// Everything the coordinator knows about one node.
///
/// Records are never removed; a silent node is only marked offline.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub online: bool,
    /// Monotonic time of the last heartbeat (`None` if never heard from)
    pub last_seen: Option<Instant>,
    pub last_seen_wall: Option<DateTime<Utc>>,

    // Last report
    pub status: NodeStatus,
    pub rtt_ms: Option<f64>,
    pub hops: u8,
    pub sensor: SensorSnapshot,
    pub health: HardwareHealth,
    pub battery_pct: Option<f64>,
    pub current_action: Option<ActionAssignment>,
    /// State the light was rendering at the last heartbeat
    pub rendered_feedback: FeedbackState,

    // Coordinator intent
    pub assignment: Option<ActionAssignment>,
    /// When the first acknowledgement carrying `assignment` was built
    pub assignment_delivered: Option<Instant>,
    pub desired_feedback: Option<FeedbackCommand>,
    pub pending: VecDeque<Command>,

    /// Newest touch timestamp forwarded from this node
    pub last_touch_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            online: false,
            last_seen: None,
            last_seen_wall: None,
            status: NodeStatus::Unknown,
            rtt_ms: None,
            hops: 0,
            sensor: SensorSnapshot::default(),
            health: HardwareHealth::default(),
            battery_pct: None,
            current_action: None,
            rendered_feedback: FeedbackState::Off,
            assignment: None,
            assignment_delivered: None,
            desired_feedback: None,
            pending: VecDeque::new(),
            last_touch_at: None,
        }
    }

    pub(super) fn apply_report(&mut self, request: &HeartbeatRequest, now: Instant) {
        self.last_seen = Some(now);
        self.last_seen_wall = Some(Utc::now());
        self.status = request.status;
        self.rtt_ms = request.rtt_ms;
        self.hops = request.hops;
        self.sensor = request.sensor.clone();
        self.health = request.health;
        self.battery_pct = request.battery_pct;
        self.current_action = request.current_action;
        self.rendered_feedback = request.feedback_state;
    }

    /// True when the last heartbeat is older than `window` at `now`.
    pub fn is_stale(&self, now: Instant, window: std::time::Duration) -> bool {
        self.last_seen
            .map_or(true, |seen| now.saturating_duration_since(seen) > window)
    }
}
