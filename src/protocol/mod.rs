//! Heartbeat Protocol
//!
//! Newline-delimited JSON over a persistent TCP stream. A station writes one
//! [`HeartbeatRequest`] line and reads exactly one [`HeartbeatResponse`] line
//! back. Lines are UTF-8, `\n` terminated and at most
//! [`MAX_LINE_BYTES`](crate::config::defaults::MAX_LINE_BYTES) long.
//!
//! Unknown fields are ignored and missing optional fields default, so either
//! side may add fields without breaking the other. A malformed line is a
//! connectivity failure: the reader closes the connection.

mod framing;

pub use framing::{read_message, write_message};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    ActionAssignment, Command, FeedbackCommand, FeedbackState, HardwareHealth, NodeId,
    NodeStatus, SensorSnapshot, TouchEvent,
};

/// Heartbeat protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed heartbeat line: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Heartbeat line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for heartbeat peer")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

// ============================================================================
// Station → Coordinator
// ============================================================================

/// Periodic (or touch-triggered) status report from a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,

    #[serde(default)]
    pub status: NodeStatus,

    /// Round-trip time of the previous heartbeat exchange (ms)
    #[serde(default)]
    pub rtt_ms: Option<f64>,

    /// Mesh hop count to the coordinator
    #[serde(default)]
    pub hops: u8,

    #[serde(default)]
    pub sensor: SensorSnapshot,

    #[serde(default)]
    pub health: HardwareHealth,

    /// Estimated battery charge (0-100 %)
    #[serde(default)]
    pub battery_pct: Option<f64>,

    /// Exercise the station is executing right now
    #[serde(default)]
    pub current_action: Option<ActionAssignment>,

    /// Touches not yet acknowledged by the coordinator
    #[serde(default)]
    pub touches: Vec<TouchEvent>,

    /// State the light is rendering
    #[serde(default)]
    pub feedback_state: FeedbackState,

    pub sent_at: DateTime<Utc>,
}

impl HeartbeatRequest {
    /// Minimal request, mostly for tests and simulators.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Ready,
            rtt_ms: None,
            hops: 1,
            sensor: SensorSnapshot::default(),
            health: HardwareHealth::default(),
            battery_pct: None,
            current_action: None,
            touches: Vec::new(),
            feedback_state: FeedbackState::Off,
            sent_at: Utc::now(),
        }
    }
}

// ============================================================================
// Coordinator → Station
// ============================================================================

/// `drill_status` when no drill session is active.
pub const IDLE_STATUS: &str = "idle";

/// Acknowledgement for exactly one heartbeat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ack: bool,

    /// Current exercise assignment, repeated until cleared
    #[serde(default)]
    pub assignment: Option<ActionAssignment>,

    /// Drill/course status string (e.g. `running:ana:2/5`)
    #[serde(default)]
    pub drill_status: String,

    /// Desired light state, repeated until changed
    #[serde(default)]
    pub feedback: Option<FeedbackCommand>,

    /// One-shot commands drained from the node's queue
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl HeartbeatResponse {
    /// True while the coordinator runs a drill session (countdown, armed
    /// target, or the pause between runs).
    pub fn drill_in_progress(&self) -> bool {
        !self.drill_status.is_empty() && self.drill_status != IDLE_STATUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drill_in_progress_from_status() {
        let mut ack = HeartbeatResponse::default();
        assert!(!ack.drill_in_progress());
        ack.drill_status = IDLE_STATUS.to_string();
        assert!(!ack.drill_in_progress());
        for status in ["countdown:Ana", "running:Ana:2/5", "complete:Ana:2100ms"] {
            ack.drill_status = status.to_string();
            assert!(ack.drill_in_progress(), "{status}");
        }
    }

    #[test]
    fn test_minimal_request_parses_with_defaults() {
        let line = r#"{"node_id":"cone-1","sent_at":"2026-03-01T10:00:00Z","firmware":"1.2"}"#;
        let req: HeartbeatRequest = serde_json::from_str(line).unwrap();
        assert_eq!(req.node_id, "cone-1");
        assert_eq!(req.status, NodeStatus::Ready);
        assert!(req.touches.is_empty());
        assert_eq!(req.feedback_state, FeedbackState::Off);
    }

    #[test]
    fn test_response_defaults() {
        let resp: HeartbeatResponse = serde_json::from_str(r#"{"ack":true}"#).unwrap();
        assert!(resp.ack);
        assert!(resp.assignment.is_none());
        assert!(resp.commands.is_empty());
        assert!(resp.feedback.is_none());
    }

    #[test]
    fn test_request_without_node_id_is_malformed() {
        assert!(serde_json::from_str::<HeartbeatRequest>(r#"{"sent_at":"2026-03-01T10:00:00Z"}"#).is_err());
    }
}
