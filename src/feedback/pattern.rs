//! State → light pattern table

use std::time::Duration;

use crate::config::FeedbackConfig;
use crate::types::FeedbackState;

/// Indicator colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);
    pub const DIM_WHITE: Rgb = Rgb::new(40, 40, 40);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const DIM_GREEN: Rgb = Rgb::new(0, 60, 0);
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const AMBER: Rgb = Rgb::new(255, 140, 0);
    pub const BLUE: Rgb = Rgb::new(0, 0, 255);
    pub const CYAN: Rgb = Rgb::new(0, 200, 255);
    pub const MAGENTA: Rgb = Rgb::new(255, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl std::fmt::Display for Rgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// What happens when a one-shot animation ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterAnimation {
    /// Return to the state that was showing before the animation
    Prior,
    /// Settle on a fixed state
    Settle(FeedbackState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Solid(Rgb),
    Blink(Rgb),
    Animation { color: Rgb, then: AfterAnimation },
}

impl Pattern {
    pub fn is_animation(&self) -> bool {
        matches!(self, Pattern::Animation { .. })
    }
}

/// The pattern table.
pub fn pattern_for(state: FeedbackState) -> Pattern {
    match state {
        FeedbackState::Off => Pattern::Solid(Rgb::OFF),
        FeedbackState::Standby => Pattern::Solid(Rgb::DIM_WHITE),
        FeedbackState::Connected => Pattern::Solid(Rgb::DIM_GREEN),
        FeedbackState::Active => Pattern::Solid(Rgb::CYAN),
        FeedbackState::NetworkError => Pattern::Blink(Rgb::RED),
        FeedbackState::Armed => Pattern::Blink(Rgb::AMBER),
        FeedbackState::Calibrating => Pattern::Blink(Rgb::BLUE),
        FeedbackState::Error => Pattern::Blink(Rgb::MAGENTA),
        FeedbackState::Success => Pattern::Animation {
            color: Rgb::GREEN,
            then: AfterAnimation::Prior,
        },
        FeedbackState::Complete => Pattern::Animation {
            color: Rgb::WHITE,
            then: AfterAnimation::Settle(FeedbackState::Standby),
        },
    }
}

/// Colour to show `elapsed` into `pattern`.
///
/// Animations flash at twice the blink rate.
pub fn frame(pattern: Pattern, elapsed: Duration, config: &FeedbackConfig) -> Rgb {
    let lit = |period_ms: u64| {
        let period_ms = period_ms.max(2);
        (elapsed.as_millis() as u64 % period_ms) < period_ms / 2
    };
    match pattern {
        Pattern::Solid(color) => color,
        Pattern::Blink(color) => {
            if lit(config.blink_period_ms) {
                color
            } else {
                Rgb::OFF
            }
        }
        Pattern::Animation { color, .. } => {
            if lit(config.blink_period_ms / 2) {
                color
            } else {
                Rgb::OFF
            }
        }
    }
}

/// True once a one-shot animation has run its course.
pub fn animation_finished(pattern: Pattern, elapsed: Duration, config: &FeedbackConfig) -> bool {
    pattern.is_animation() && elapsed >= Duration::from_millis(config.animation_ms)
}
