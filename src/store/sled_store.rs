//! Sled-backed run store
//!
//! Trees: `sessions`, `courses`, `runs` keyed by id; `segments` keyed by
//! `<run id>/<u64 big-endian sequence>` so a prefix scan returns one run's
//! log in append order.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use super::{
    CourseDefinition, NewSession, RunRecord, RunStore, SegmentRecord, SessionRecord, StoreError,
};

#[derive(Clone)]
pub struct SledRunStore {
    db: sled::Db,
    sessions: sled::Tree,
    courses: sled::Tree,
    runs: sled::Tree,
    segments: sled::Tree,
}

impl SledRunStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            sessions: db.open_tree("sessions")?,
            courses: db.open_tree("courses")?,
            runs: db.open_tree("runs")?,
            segments: db.open_tree("segments")?,
            db,
        })
    }

    pub fn put_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        put(&self.sessions, &session.id, session)
    }

    pub fn put_course(&self, course: &CourseDefinition) -> Result<(), StoreError> {
        put(&self.courses, &course.id, course)
    }

    pub fn put_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        put(&self.runs, &run.id, run)
    }

    /// Write a new session with its course and runs.
    pub fn put_new_session(&self, new: &NewSession) -> Result<(), StoreError> {
        self.put_course(&new.course)?;
        for run in &new.runs {
            self.put_run(run)?;
        }
        self.put_session(&new.session)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn segment_prefix(run_id: &str) -> Vec<u8> {
        let mut prefix = run_id.as_bytes().to_vec();
        prefix.push(b'/');
        prefix
    }
}

fn put<T: Serialize>(tree: &sled::Tree, id: &str, value: &T) -> Result<(), StoreError> {
    tree.insert(id.as_bytes(), serde_json::to_vec(value)?)?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, kind: &'static str, id: &str) -> Result<T, StoreError> {
    let bytes = tree
        .get(id.as_bytes())?
        .ok_or_else(|| StoreError::not_found(kind, id))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl RunStore for SledRunStore {
    async fn fetch_session(&self, id: &str) -> Result<SessionRecord, StoreError> {
        get(&self.sessions, "session", id)
    }

    async fn fetch_course(&self, id: &str) -> Result<CourseDefinition, StoreError> {
        get(&self.courses, "course", id)
    }

    async fn fetch_run(&self, id: &str) -> Result<RunRecord, StoreError> {
        get(&self.runs, "run", id)
    }

    async fn append_segment(&self, segment: &SegmentRecord) -> Result<(), StoreError> {
        let mut key = Self::segment_prefix(&segment.run_id);
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        self.segments.insert(key, serde_json::to_vec(segment)?)?;
        Ok(())
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.put_run(run)
    }

    async fn segments_for_run(&self, run_id: &str) -> Result<Vec<SegmentRecord>, StoreError> {
        let mut segments = Vec::new();
        for item in self.segments.scan_prefix(Self::segment_prefix(run_id)) {
            let (_, value) = item?;
            segments.push(serde_json::from_slice::<SegmentRecord>(&value)?);
        }
        segments.sort_by_key(|s| s.ordinal);
        Ok(segments)
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
