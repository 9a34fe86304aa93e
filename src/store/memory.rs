//! In-memory run store
//!
//! Thread-safe via `RwLock`. Not durable - data lost on restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    CourseDefinition, NewSession, RunRecord, RunStore, SegmentRecord, SessionRecord, StoreError,
};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    courses: HashMap<String, CourseDefinition>,
    runs: HashMap<String, RunRecord>,
    segments: HashMap<String, Vec<SegmentRecord>>,
}

#[derive(Default)]
pub struct MemoryRunStore {
    tables: RwLock<Tables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_session(&self, session: SessionRecord) {
        self.write().sessions.insert(session.id.clone(), session);
    }

    pub fn put_course(&self, course: CourseDefinition) {
        self.write().courses.insert(course.id.clone(), course);
    }

    pub fn put_run(&self, run: RunRecord) {
        self.write().runs.insert(run.id.clone(), run);
    }

    pub fn put_new_session(&self, new: NewSession) {
        let mut tables = self.write();
        tables.courses.insert(new.course.id.clone(), new.course);
        for run in new.runs {
            tables.runs.insert(run.id.clone(), run);
        }
        tables.sessions.insert(new.session.id.clone(), new.session);
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn fetch_session(&self, id: &str) -> Result<SessionRecord, StoreError> {
        self.read()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    async fn fetch_course(&self, id: &str) -> Result<CourseDefinition, StoreError> {
        self.read()
            .courses
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("course", id))
    }

    async fn fetch_run(&self, id: &str) -> Result<RunRecord, StoreError> {
        self.read()
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("run", id))
    }

    async fn append_segment(&self, segment: &SegmentRecord) -> Result<(), StoreError> {
        self.write()
            .segments
            .entry(segment.run_id.clone())
            .or_default()
            .push(segment.clone());
        Ok(())
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.put_run(run.clone());
        Ok(())
    }

    async fn segments_for_run(&self, run_id: &str) -> Result<Vec<SegmentRecord>, StoreError> {
        let mut segments = self.read().segments.get(run_id).cloned().unwrap_or_default();
        segments.sort_by_key(|s| s.ordinal);
        Ok(segments)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
