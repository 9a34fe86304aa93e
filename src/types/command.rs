//! Coordinator-to-node commands and exercise assignments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Commands
// ============================================================================

/// One-shot command carried in a heartbeat acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Calibration sub-action for the detection engine
    Calibrate { op: CalibrateOp },
    /// Cancel the running exercise and clear the assignment
    Stop,
    /// Play a clip on the node's speaker
    PlayAudio { clip: AudioClip },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Calibrate { op } => write!(f, "calibrate:{op}"),
            Command::Stop => write!(f, "stop"),
            Command::PlayAudio { clip } => write!(f, "play_audio:{clip}"),
        }
    }
}

/// Calibration sub-actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CalibrateOp {
    /// Replace the live detection threshold and persist it
    SetThreshold { threshold_g: f64 },
    /// Tag touches as test touches for `duration_ms`
    TestMode { duration_ms: u64 },
    /// Run the guided tap calibration
    Guided,
}

impl std::fmt::Display for CalibrateOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrateOp::SetThreshold { threshold_g } => write!(f, "set_threshold({threshold_g:.3}g)"),
            CalibrateOp::TestMode { duration_ms } => write!(f, "test_mode({duration_ms}ms)"),
            CalibrateOp::Guided => write!(f, "guided"),
        }
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Named audio clips a station can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum AudioClip {
    Beep,
    Countdown { n: u32 },
    Go,
    Success,
    Stop,
    Elapsed { millis: u64 },
}

impl std::fmt::Display for AudioClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioClip::Beep => write!(f, "beep"),
            AudioClip::Countdown { n } => write!(f, "countdown:{n}"),
            AudioClip::Go => write!(f, "go"),
            AudioClip::Success => write!(f, "success"),
            AudioClip::Stop => write!(f, "stop"),
            AudioClip::Elapsed { millis } => write!(f, "elapsed:{millis}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown audio clip '{0}' (expected beep, go, success, stop, countdown:<n>, elapsed:<ms>)")]
pub struct UnknownAudioClip(pub String);

impl FromStr for AudioClip {
    type Err = UnknownAudioClip;

    /// Parses the console form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || UnknownAudioClip(s.to_string());
        let (name, arg) = match s.trim().split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s.trim(), None),
        };
        match (name, arg) {
            ("beep", None) => Ok(AudioClip::Beep),
            ("go", None) => Ok(AudioClip::Go),
            ("success", None) => Ok(AudioClip::Success),
            ("stop", None) => Ok(AudioClip::Stop),
            ("countdown", Some(n)) => n.parse().map(|n| AudioClip::Countdown { n }).map_err(|_| err()),
            ("elapsed", Some(ms)) => ms
                .parse()
                .map(|millis| AudioClip::Elapsed { millis })
                .map_err(|_| err()),
            _ => Err(err()),
        }
    }
}

// ============================================================================
// Exercise Assignments
// ============================================================================

/// Exercise sequence a station executes locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Neutral light, detection idle
    Standby,
    /// Arm the light and wait for one touch
    Touch,
    /// Active light for a fixed duration
    Timed { duration_ms: u64 },
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Standby => write!(f, "standby"),
            ActionKind::Touch => write!(f, "touch"),
            ActionKind::Timed { duration_ms } => write!(f, "timed({duration_ms}ms)"),
        }
    }
}

/// An exercise assigned to one node.
///
/// `id` is unique per registry, so a station can tell a repeated
/// acknowledgement from a fresh assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionAssignment {
    pub id: u64,
    pub kind: ActionKind,
    pub assigned_at: DateTime<Utc>,
}
