//! Config Validation Tests
//!
//! Typo detection for unknown keys and cross-field validation of
//! `MeshConfig`, exercised through the public config API.

use agility_mesh::config::validation::{known_config_keys, suggest_correction, validate_unknown_keys};
use agility_mesh::config::{ConfigError, MeshConfig};

// ============================================================================
// Typo Detection
// ============================================================================

#[test]
fn typo_in_drill_section_warns_with_suggestion() {
    let toml_str = r#"
[drill]
countdown_tiks = 3
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert!(warnings[0].field.contains("countdown_tiks"));
    assert_eq!(warnings[0].suggestion.as_deref(), Some("drill.countdown_ticks"));
}

#[test]
fn typo_in_station_section_warns() {
    let toml_str = r#"
[station]
nod_id = "cone-1"
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].suggestion.as_deref(), Some("station.node_id"));
}

#[test]
fn valid_config_produces_zero_warnings() {
    let toml_str = r#"
[station]
node_id = "cone-3"
coordinator_addr = "192.168.4.1:7070"
hops = 2
sensor_mode = "4g"

[link]
heartbeat_interval_ms = 1000

[detection]
debounce_ms = 400
coordinator_debounce_ms = 200
calibration_dir = "/var/lib/agility/calibration"

[guided]
taps = 5
threshold_ratio = 0.6

[coordinator]
listen_addr = "0.0.0.0:7070"
local_node = false

[drill]
countdown_ticks = 3
touch_timeout_ms = 8000
inter_run_pause_ms = 2000
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert!(
        warnings.is_empty(),
        "Valid config should produce 0 warnings, got: {:?}",
        warnings.iter().map(|w| &w.field).collect::<Vec<_>>()
    );
    let config: MeshConfig = toml::from_str(toml_str).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.drill.touch_timeout_ms, Some(8000));
}

#[test]
fn unknown_section_warns() {
    let toml_str = r#"
[dashboard]
port = 8080
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert!(warnings.iter().any(|w| w.field.contains("dashboard")));
}

#[test]
fn garbage_key_has_no_suggestion() {
    let known = known_config_keys();
    assert!(suggest_correction("zzzzzzzzzzzz", &known).is_none());
}

// ============================================================================
// Range Validation
// ============================================================================

#[test]
fn heartbeat_must_be_faster_than_offline_window() {
    let mut config = MeshConfig::default();
    config.link.heartbeat_interval_ms = 20_000;
    config.coordinator.offline_after_ms = 10_000;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("heartbeat_interval_ms"));
}

#[test]
fn drill_poll_may_not_exceed_heartbeat() {
    let mut config = MeshConfig::default();
    config.link.drill_poll_ms = config.link.heartbeat_interval_ms + 1;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("drill_poll_ms"));

    config.link.drill_poll_ms = 0;
    assert!(config.validate().is_err());
    config.link.drill_poll_ms = config.link.heartbeat_interval_ms;
    assert!(config.validate().is_ok());
}

#[test]
fn threshold_ratio_must_be_inside_unit_interval() {
    let mut config = MeshConfig::default();
    config.guided.threshold_ratio = 1.0;
    assert!(config.validate().is_err());
    config.guided.threshold_ratio = 0.6;
    assert!(config.validate().is_ok());
}

#[test]
fn rest_window_must_yield_enough_samples() {
    let mut config = MeshConfig::default();
    config.detection.sample_rate_hz = 100;
    config.detection.rest_duration_ms = 100;
    config.detection.min_rest_samples = 50;
    match config.validate() {
        Err(ConfigError::Validation(errors)) => {
            assert!(errors.iter().any(|e| e.contains("rest_duration_ms")));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn every_violation_is_reported() {
    let mut config = MeshConfig::default();
    config.drill.target_count = 0;
    config.drill.touch_timeout_ms = Some(0);
    config.feedback.frame_ms = 0;
    match config.validate() {
        Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 3, "{errors:?}"),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn load_from_file_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mesh_config.toml");
    std::fs::write(&path, "[drill]\ntarget_count = 0\n").unwrap();
    assert!(matches!(
        MeshConfig::load_from_file(&path),
        Err(ConfigError::Validation(_))
    ));
}
