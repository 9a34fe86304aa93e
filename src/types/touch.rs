//! Touch events emitted by the detection engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeId;

/// One debounced threshold crossing on a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchEvent {
    pub node_id: NodeId,
    /// Wall-clock time of the crossing on the station
    pub at: DateTime<Utc>,
    /// Deviation magnitude at the crossing (g)
    pub magnitude_g: f64,
    /// Raised while test mode is active; never forwarded to the coordinator
    #[serde(default)]
    pub test_mode: bool,
}

impl TouchEvent {
    pub fn new(node_id: impl Into<NodeId>, at: DateTime<Utc>, magnitude_g: f64) -> Self {
        Self {
            node_id: node_id.into(),
            at,
            magnitude_g,
            test_mode: false,
        }
    }
}
