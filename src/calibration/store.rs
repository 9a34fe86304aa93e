//! Calibration file persistence
//!
//! One pretty-printed JSON file per node: `<dir>/calibration_<node>.json`.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{CalibrationError, CalibrationProfile};

/// Directory of per-node calibration files.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `node_id`'s profile. Path separators in the id are
    /// replaced so every node maps to a file directly inside the directory.
    pub fn path_for(&self, node_id: &str) -> PathBuf {
        let safe: String = node_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("calibration_{safe}.json"))
    }

    /// Load `node_id`'s profile.
    ///
    /// Returns `None` when the file is missing, corrupt, written for another
    /// node, or fails [`CalibrationProfile::is_valid`].
    pub fn load(&self, node_id: &str) -> Option<CalibrationProfile> {
        let path = self.path_for(node_id);
        let json = match std::fs::read_to_string(&path) {
            Ok(j) => j,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No calibration file found");
                return None;
            }
        };
        let profile: CalibrationProfile = match serde_json::from_str(&json) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt calibration file, ignoring");
                return None;
            }
        };
        if profile.node_id != node_id {
            warn!(
                path = %path.display(),
                file_node = %profile.node_id,
                node = %node_id,
                "Calibration file belongs to another node, ignoring"
            );
            return None;
        }
        if !profile.is_valid() {
            warn!(
                path = %path.display(),
                schema = profile.schema_version,
                threshold_g = profile.threshold_g,
                noise_floor_g = profile.noise_floor_g,
                "Invalid calibration profile, ignoring"
            );
            return None;
        }
        info!(
            node = %node_id,
            threshold_g = profile.threshold_g,
            baseline = %profile.baseline,
            "Calibration profile loaded"
        );
        Some(profile)
    }

    /// Write `profile` atomically (temp file + rename).
    pub fn save(&self, profile: &CalibrationProfile) -> Result<PathBuf, CalibrationError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&profile.node_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(profile)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        info!(
            path = %path.display(),
            threshold_g = profile.threshold_g,
            "Calibration profile saved"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{RestBaseline, SensorMode};
    use crate::types::Vector3;

    fn profile(node: &str) -> CalibrationProfile {
        let rest = RestBaseline {
            baseline: Vector3::new(0.01, -0.02, 0.98),
            noise_floor_g: 0.03,
            noise_std_g: 0.01,
            samples: 200,
        };
        CalibrationProfile::new(node, &rest, 0.35, SensorMode::G4).with_hardware(true, 0x19)
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("nested"));
        let saved = profile("cone-1");
        let path = store.save(&saved).unwrap();
        assert!(path.ends_with("calibration_cone-1.json"));
        assert_eq!(store.load("cone-1"), Some(saved));
        assert!(store.load("cone-2").is_none());
    }

    #[test]
    fn test_corrupt_and_invalid_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());

        std::fs::write(store.path_for("cone-1"), "{ not json").unwrap();
        assert!(store.load("cone-1").is_none());

        let bad = profile("cone-2").with_threshold(0.01);
        std::fs::write(store.path_for("cone-2"), serde_json::to_string(&bad).unwrap()).unwrap();
        assert!(store.load("cone-2").is_none());
    }

    #[test]
    fn test_file_for_other_node_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        let other = profile("cone-9");
        std::fs::write(store.path_for("cone-1"), serde_json::to_string(&other).unwrap()).unwrap();
        assert!(store.load("cone-1").is_none());
    }

    #[test]
    fn test_path_is_sanitised() {
        let store = CalibrationStore::new("/tmp/cal");
        assert_eq!(
            store.path_for("10.0.0.7:7070"),
            PathBuf::from("/tmp/cal/calibration_10.0.0.7_7070.json")
        );
    }
}
