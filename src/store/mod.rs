//! Run Store - sessions, courses, runs and the segment log
//!
//! The orchestrator only needs a narrow slice of the roster/course store:
//! fetch a session and its course, append a segment for each accepted touch,
//! and update a run's status and timing. [`RunStore`] is that slice:
//! - `SledRunStore`: durable, one sled tree per record kind
//! - `MemoryRunStore`: in-memory store for tests and the simulation

mod memory;
mod sled_store;

pub use memory::MemoryRunStore;
pub use sled_store::SledRunStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ActionKind, NodeId, RunStatus};

/// Run store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One step of a course, bound to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseAction {
    pub node_id: NodeId,
    pub kind: ActionKind,
    #[serde(default)]
    pub min_ms: Option<u64>,
    #[serde(default)]
    pub max_ms: Option<u64>,
    /// Reaching this action counts as finishing the course
    #[serde(default)]
    pub marks_completion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseDefinition {
    pub id: String,
    pub name: String,
    pub actions: Vec<CourseAction>,
}

impl CourseDefinition {
    /// Distinct node ids of the course's actions in order, without `exclude`.
    pub fn target_nodes(&self, exclude: &str) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::new();
        for action in &self.actions {
            if action.node_id != exclude && !nodes.contains(&action.node_id) {
                nodes.push(action.node_id.clone());
            }
        }
        nodes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub course_id: String,
    /// Roster order
    pub run_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub session_id: String,
    pub athlete: String,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    /// Why a failed run failed (`stopped`, `touch-timeout`)
    #[serde(default)]
    pub failure: Option<String>,
}

impl RunRecord {
    pub fn queued(id: impl Into<String>, session_id: impl Into<String>, athlete: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            athlete: athlete.into(),
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            elapsed_ms: None,
            failure: None,
        }
    }
}

/// One accepted touch within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub run_id: String,
    /// 1-based position in the run's target permutation
    pub ordinal: u32,
    pub node_id: NodeId,
    /// Time since "go" (ms)
    pub split_ms: u64,
    pub magnitude_g: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Records for a new reaction drill: one touch action per target and one
/// queued run per athlete, all under fresh ids.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub course: CourseDefinition,
    pub session: SessionRecord,
    pub runs: Vec<RunRecord>,
}

impl NewSession {
    pub fn reaction(name: &str, targets: &[NodeId], athletes: &[String]) -> Self {
        let course = CourseDefinition {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            actions: targets
                .iter()
                .map(|node_id| CourseAction {
                    node_id: node_id.clone(),
                    kind: ActionKind::Touch,
                    min_ms: None,
                    max_ms: None,
                    marks_completion: false,
                })
                .collect(),
        };
        let session_id = Uuid::new_v4().to_string();
        let runs: Vec<RunRecord> = athletes
            .iter()
            .map(|athlete| RunRecord::queued(Uuid::new_v4().to_string(), session_id.clone(), athlete.clone()))
            .collect();
        let session = SessionRecord {
            id: session_id,
            course_id: course.id.clone(),
            run_ids: runs.iter().map(|r| r.id.clone()).collect(),
            created_at: Utc::now(),
        };
        Self { course, session, runs }
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Storage the orchestrator reads sessions from and records outcomes to.
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn fetch_session(&self, id: &str) -> Result<SessionRecord, StoreError>;

    async fn fetch_course(&self, id: &str) -> Result<CourseDefinition, StoreError>;

    async fn fetch_run(&self, id: &str) -> Result<RunRecord, StoreError>;

    /// Append to the run's segment log.
    async fn append_segment(&self, segment: &SegmentRecord) -> Result<(), StoreError>;

    /// Write the run's status and timing, inserting the record if absent.
    async fn update_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    /// Segments of one run in ordinal order.
    async fn segments_for_run(&self, run_id: &str) -> Result<Vec<SegmentRecord>, StoreError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(node: &str) -> CourseAction {
        CourseAction {
            node_id: node.to_string(),
            kind: ActionKind::Touch,
            min_ms: None,
            max_ms: None,
            marks_completion: false,
        }
    }

    #[test]
    fn test_target_nodes_distinct_in_order() {
        let course = CourseDefinition {
            id: "c1".into(),
            name: "Reaction".into(),
            actions: ["cone-2", "coordinator", "cone-1", "cone-2", "cone-3"]
                .into_iter()
                .map(action)
                .collect(),
        };
        assert_eq!(course.target_nodes("coordinator"), vec!["cone-2", "cone-1", "cone-3"]);
    }

    #[test]
    fn test_run_record_defaults_from_json() {
        let json = r#"{"id":"r1","session_id":"s1","athlete":"Ana","status":"queued"}"#;
        let run: RunRecord = serde_json::from_str(json).unwrap();
        assert_eq!(run, RunRecord::queued("r1", "s1", "Ana"));
    }

    #[test]
    fn test_new_session_links_records() {
        let targets: Vec<NodeId> = vec!["cone-1".into(), "cone-2".into()];
        let new = NewSession::reaction("Reaction", &targets, &["Ana".to_string(), "Ben".to_string()]);
        assert_eq!(new.session.course_id, new.course.id);
        assert_eq!(new.course.target_nodes("coordinator"), targets);
        assert_eq!(new.session.run_ids.len(), 2);
        assert!(new
            .runs
            .iter()
            .all(|r| r.session_id == new.session.id && r.status == RunStatus::Queued));
    }
}
