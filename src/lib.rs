//! Agility Mesh: Reaction-Drill Training Stations
//!
//! A coordinator and a small mesh of touch stations linked by a heartbeat
//! protocol.
//!
//! ## Architecture
//!
//! - **Detection**: per-station accelerometer sampling, calibration and debounced touches
//! - **Link**: station side of the heartbeat protocol, drives feedback and exercises
//! - **Registry / Server**: coordinator-side node table and heartbeat endpoint
//! - **Orchestrator**: reaction-drill state machine with exactly-once touch attribution
//! - **Store**: session, course, run and segment persistence

pub mod config;
pub mod types;
pub mod protocol;
pub mod calibration;
pub mod detection;
pub mod feedback;
pub mod link;
pub mod registry;
pub mod server;
pub mod orchestrator;
pub mod store;
pub mod console;

// Re-export configuration
pub use config::MeshConfig;

// Re-export commonly used types
pub use types::{
    ActionAssignment, ActionKind, AudioClip, CalibrateOp, Command, FeedbackCommand,
    FeedbackState, NodeId, NodeStatus, RunStatus, SensorSnapshot, TouchEvent,
};

// Re-export the coordinator components
pub use orchestrator::{DrillError, Orchestrator, TouchOutcome};
pub use registry::NodeRegistry;
pub use server::HeartbeatServer;
pub use store::{MemoryRunStore, NewSession, RunStore, SledRunStore, StoreError};

// Re-export the station components
pub use detection::{DetectionEngine, DetectionHandle, SimulatedSensor};
pub use feedback::FeedbackController;
pub use link::{LinkError, NodeLink};
