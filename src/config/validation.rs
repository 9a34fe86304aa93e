//! Unknown-key detection for `mesh_config.toml`.
//!
//! The raw file is parsed into a `toml::Value` first and every dotted key path
//! is checked against the fields `MeshConfig` understands. Unknown keys become
//! warnings with an edit-distance hint; the serde pass that follows ignores
//! them, so a typo never stops a station from booting.

use std::collections::HashSet;

/// A non-fatal config warning (typo, misplaced key).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every dotted key path `MeshConfig` accepts. Kept in step with the section
/// structs by hand.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [station]
        "station",
        "station.node_id",
        "station.coordinator_addr",
        "station.hops",
        "station.sensor_mode",
        "station.bus_address",
        "station.g_force",
        "station.battery_start_pct",
        "station.battery_drain_pct_per_hour",
        // [link]
        "link",
        "link.heartbeat_interval_ms",
        "link.drill_poll_ms",
        "link.retry_delay_ms",
        "link.connect_timeout_ms",
        "link.io_timeout_ms",
        // [detection]
        "detection",
        "detection.sample_rate_hz",
        "detection.debounce_ms",
        "detection.coordinator_debounce_ms",
        "detection.default_threshold_g",
        "detection.rest_duration_ms",
        "detection.min_rest_samples",
        "detection.noise_sigma",
        "detection.calibration_dir",
        // [guided]
        "guided",
        "guided.taps",
        "guided.tap_timeout_ms",
        "guided.threshold_step_g",
        "guided.max_retries",
        "guided.initial_accept_g",
        "guided.tap_settle_ms",
        "guided.threshold_ratio",
        // [feedback]
        "feedback",
        "feedback.frame_ms",
        "feedback.blink_period_ms",
        "feedback.animation_ms",
        // [coordinator]
        "coordinator",
        "coordinator.listen_addr",
        "coordinator.node_id",
        "coordinator.offline_after_ms",
        "coordinator.sweep_interval_ms",
        "coordinator.data_dir",
        "coordinator.local_node",
        // [drill]
        "drill",
        "drill.countdown_ticks",
        "drill.countdown_tick_ms",
        "drill.target_count",
        "drill.touch_timeout_ms",
        "drill.inter_run_pause_ms",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Dotted paths of every key in `value`, tables before their children.
///
/// `{ drill = { countdown_ticks = 3 } }` yields `["drill", "drill.countdown_ticks"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let Some(table) = value.as_table() else {
        return Vec::new();
    };
    table
        .iter()
        .flat_map(|(key, child)| {
            let path = match prefix {
                "" => key.clone(),
                p => format!("{p}.{key}"),
            };
            let nested = walk_toml_keys(child, &path);
            std::iter::once(path).chain(nested)
        })
        .collect()
}

// ============================================================================
// Suggestions
// ============================================================================

/// Edit distance counted in characters.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitute = diagonal + usize::from(ca != cb);
            diagonal = row[j + 1];
            row[j + 1] = substitute.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

/// Closest known key within [`MAX_SUGGESTION_DISTANCE`] edits. Ties go to the
/// alphabetically first key so the hint is stable between runs.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|&k| (levenshtein(unknown, k), k))
        .filter(|&(dist, _)| dist <= MAX_SUGGESTION_DISTANCE)
        .min()
        .map(|(_, k)| k.to_string())
}

const MAX_SUGGESTION_DISTANCE: usize = 3;

// ============================================================================
// Unknown Key Validation
// ============================================================================

/// Warnings for every key in `raw_toml` that `MeshConfig` does not know.
///
/// Never fails: unparseable input yields no warnings and is reported by the
/// serde pass that follows.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };
    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            message: format!("Unknown config key '{key}'"),
            suggestion: suggest_correction(&key, &known),
            field: key,
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
