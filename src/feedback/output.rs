//! Indicator and speaker outputs

use tracing::{debug, info};

use super::Rgb;
use crate::types::{AudioClip, NodeId};

/// Physical status light.
///
/// Driven only from the feedback render thread, and only when the colour
/// changes.
pub trait Indicator: Send + 'static {
    fn show(&mut self, color: Rgb);
}

/// Indicator that writes colour changes to the log.
#[derive(Debug, Clone)]
pub struct LogIndicator {
    node_id: NodeId,
}

impl LogIndicator {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl Indicator for LogIndicator {
    fn show(&mut self, color: Rgb) {
        debug!(node = %self.node_id, color = %color, "Indicator");
    }
}

/// Station speaker.
pub trait AudioSink: Send + Sync + 'static {
    fn play(&self, clip: AudioClip);
}

/// Speaker that announces clips in the log.
#[derive(Debug, Clone)]
pub struct LogAudio {
    node_id: NodeId,
}

impl LogAudio {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl AudioSink for LogAudio {
    fn play(&self, clip: AudioClip) {
        match clip {
            AudioClip::Elapsed { millis } => {
                info!(node = %self.node_id, "🔊 Time: {:.2}s", millis as f64 / 1000.0);
            }
            other => info!(node = %self.node_id, clip = %other, "🔊 Audio"),
        }
    }
}
