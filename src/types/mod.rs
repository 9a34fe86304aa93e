//! Shared data structures for the training mesh
//!
//! These types cross the heartbeat link and are shared by the coordinator and
//! the stations:
//! - Node reports: SensorSnapshot, HardwareHealth, NodeStatus
//! - Feedback: FeedbackState (named light states) and FeedbackCommand
//! - Commands: Command, CalibrateOp, AudioClip, ActionAssignment
//! - Touches: TouchEvent
//! - Drill runs: RunStatus

mod node;
mod feedback;
mod command;
mod touch;
mod drill;

pub use node::*;
pub use feedback::*;
pub use command::*;
pub use touch::*;
pub use drill::*;
