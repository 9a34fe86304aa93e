//! Named status light states and the coordinator's feedback command

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Logical light state a station renders.
///
/// The wire and console form is the kebab-case name from [`FeedbackState::ALL`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackState {
    #[default]
    Off,
    Standby,
    Connected,
    NetworkError,
    Armed,
    Active,
    Success,
    Complete,
    Calibrating,
    Error,
}

impl FeedbackState {
    /// Name table, validated wherever a state name is first parsed.
    pub const ALL: [(FeedbackState, &'static str); 10] = [
        (FeedbackState::Off, "off"),
        (FeedbackState::Standby, "standby"),
        (FeedbackState::Connected, "connected"),
        (FeedbackState::NetworkError, "network-error"),
        (FeedbackState::Armed, "armed"),
        (FeedbackState::Active, "active"),
        (FeedbackState::Success, "success"),
        (FeedbackState::Complete, "complete"),
        (FeedbackState::Calibrating, "calibrating"),
        (FeedbackState::Error, "error"),
    ];

    pub fn name(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(state, _)| state == self)
            .map_or("off", |(_, name)| name)
    }
}

impl std::fmt::Display for FeedbackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown feedback state '{0}'")]
pub struct UnknownFeedbackState(pub String);

impl FromStr for FeedbackState {
    type Err = UnknownFeedbackState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|(_, name)| *name == needle)
            .map(|(state, _)| *state)
            .ok_or_else(|| UnknownFeedbackState(s.to_string()))
    }
}

/// Desired light state as issued by the coordinator.
///
/// Repeated in every acknowledgement; stations apply it only when
/// `issued_at` is newer than the last command they applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCommand {
    pub state: FeedbackState,
    pub issued_at: DateTime<Utc>,
}

impl FeedbackCommand {
    pub fn new(state: FeedbackState, issued_at: DateTime<Utc>) -> Self {
        Self { state, issued_at }
    }

    /// True when this command should replace `applied`.
    pub fn supersedes(&self, applied: Option<&FeedbackCommand>) -> bool {
        applied.map_or(true, |last| self.issued_at > last.issued_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_table_matches_serde() {
        for (state, name) in FeedbackState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{name}\""));
            assert_eq!(name.parse::<FeedbackState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert!("disco".parse::<FeedbackState>().is_err());
        assert!(serde_json::from_str::<FeedbackState>("\"disco\"").is_err());
    }

    #[test]
    fn test_older_command_does_not_supersede() {
        let now = Utc::now();
        let newer = FeedbackCommand::new(FeedbackState::Armed, now);
        let older = FeedbackCommand::new(FeedbackState::Off, now - chrono::Duration::seconds(1));
        assert!(newer.supersedes(Some(&older)));
        assert!(!older.supersedes(Some(&newer)));
        assert!(!newer.supersedes(Some(&newer)));
        assert!(older.supersedes(None));
    }
}
