//! Feedback Controller - per-station status light state machine
//!
//! [`FeedbackController::set_state`] is a plain assignment under a short lock,
//! so callers never wait on the indicator. A dedicated render thread polls the
//! current state every frame and drives the [`Indicator`]:
//!
//! - Solid states show one colour
//! - Blinking states toggle every half blink period
//! - One-shot animations run for `animation_ms`, then either return to the
//!   state that was showing before (`success`) or settle on a fixed state
//!   (`complete` → `standby`)

mod output;
mod pattern;

pub use output::{AudioSink, Indicator, LogAudio, LogIndicator};
pub use pattern::{animation_finished, frame, pattern_for, AfterAnimation, Pattern, Rgb};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::config::FeedbackConfig;
use crate::types::{FeedbackState, NodeId};

#[derive(Debug, Clone, Copy)]
struct Current {
    state: FeedbackState,
    /// State an animation reverts to
    prior: FeedbackState,
    since: Instant,
    generation: u64,
}

struct Shared {
    current: Mutex<Current>,
    running: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Logical light state plus the thread that renders it.
pub struct FeedbackController {
    node_id: NodeId,
    shared: Arc<Shared>,
    render: Mutex<Option<JoinHandle<()>>>,
}

impl FeedbackController {
    /// Start the render thread with the light off.
    pub fn start<I: Indicator>(
        node_id: impl Into<NodeId>,
        config: FeedbackConfig,
        mut indicator: I,
    ) -> std::io::Result<Self> {
        let node_id = node_id.into();
        let shared = Arc::new(Shared {
            current: Mutex::new(Current {
                state: FeedbackState::Off,
                prior: FeedbackState::Off,
                since: Instant::now(),
                generation: 0,
            }),
            running: AtomicBool::new(true),
        });

        let thread_shared = Arc::clone(&shared);
        let render = std::thread::Builder::new()
            .name(format!("feedback-{node_id}"))
            .spawn(move || render_loop(&thread_shared, &config, &mut indicator))?;

        Ok(Self {
            node_id,
            shared,
            render: Mutex::new(Some(render)),
        })
    }

    /// Request `state`.
    ///
    /// Re-requesting a steady state keeps its blink phase; re-requesting an
    /// animation restarts it.
    pub fn set_state(&self, state: FeedbackState) {
        let mut current = self.shared.lock();
        if current.state == state && !pattern_for(state).is_animation() {
            return;
        }
        let prior = if pattern_for(current.state).is_animation() {
            current.prior
        } else {
            current.state
        };
        debug!(node = %self.node_id, from = %current.state, to = %state, "Feedback state");
        *current = Current {
            state,
            prior,
            since: Instant::now(),
            generation: current.generation.wrapping_add(1),
        };
    }

    pub fn get_state(&self) -> FeedbackState {
        self.shared.lock().state
    }

    /// Stop and join the render thread. Idempotent.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self
            .render
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(node = %self.node_id, "Feedback render thread panicked");
            }
        }
    }
}

impl Drop for FeedbackController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn render_loop<I: Indicator>(shared: &Shared, config: &FeedbackConfig, indicator: &mut I) {
    let frame_interval = Duration::from_millis(config.frame_ms.max(1));
    let mut shown: Option<Rgb> = None;

    while shared.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        let current = *shared.lock();
        let pattern = pattern_for(current.state);
        let elapsed = now.saturating_duration_since(current.since);

        if animation_finished(pattern, elapsed, config) {
            let next = match pattern {
                Pattern::Animation { then: AfterAnimation::Settle(state), .. } => state,
                _ => current.prior,
            };
            let mut guard = shared.lock();
            // A set_state since the snapshot wins over the revert
            if guard.generation == current.generation {
                *guard = Current {
                    state: next,
                    prior: next,
                    since: now,
                    generation: guard.generation.wrapping_add(1),
                };
            }
            continue;
        }

        let color = frame(pattern, elapsed, config);
        if shown != Some(color) {
            indicator.show(color);
            shown = Some(color);
        }
        std::thread::sleep(frame_interval);
    }
    if shown != Some(Rgb::OFF) {
        indicator.show(Rgb::OFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Rgb>>>);

    impl Indicator for Recorder {
        fn show(&mut self, color: Rgb) {
            self.0.lock().unwrap().push(color);
        }
    }

    fn fast() -> FeedbackConfig {
        FeedbackConfig {
            frame_ms: 2,
            blink_period_ms: 20,
            animation_ms: 40,
        }
    }

    fn wait_for(ctrl: &FeedbackController, state: FeedbackState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if ctrl.get_state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_set_then_get() {
        let ctrl = FeedbackController::start("cone-1", fast(), Recorder::default()).unwrap();
        assert_eq!(ctrl.get_state(), FeedbackState::Off);
        ctrl.set_state(FeedbackState::Armed);
        assert_eq!(ctrl.get_state(), FeedbackState::Armed);
    }

    #[test]
    fn test_success_reverts_to_prior_state() {
        let ctrl = FeedbackController::start("cone-1", fast(), Recorder::default()).unwrap();
        ctrl.set_state(FeedbackState::Connected);
        ctrl.set_state(FeedbackState::Success);
        // A repeated success must not make success its own prior
        ctrl.set_state(FeedbackState::Success);
        assert!(wait_for(&ctrl, FeedbackState::Connected));
    }

    #[test]
    fn test_complete_settles_on_standby() {
        let ctrl = FeedbackController::start("cone-1", fast(), Recorder::default()).unwrap();
        ctrl.set_state(FeedbackState::Active);
        ctrl.set_state(FeedbackState::Complete);
        assert!(wait_for(&ctrl, FeedbackState::Standby));
    }

    #[test]
    fn test_new_state_during_animation_wins() {
        let mut config = fast();
        config.animation_ms = 200;
        let ctrl = FeedbackController::start("cone-1", config, Recorder::default()).unwrap();
        ctrl.set_state(FeedbackState::Success);
        ctrl.set_state(FeedbackState::Active);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(ctrl.get_state(), FeedbackState::Active);
    }

    #[test]
    fn test_rapid_set_state_does_not_block() {
        let ctrl = FeedbackController::start("cone-1", fast(), Recorder::default()).unwrap();
        let started = Instant::now();
        for i in 0..10_000 {
            let state = if i % 2 == 0 { FeedbackState::Armed } else { FeedbackState::Off };
            ctrl.set_state(state);
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ctrl.get_state(), FeedbackState::Off);
    }

    #[test]
    fn test_indicator_sees_colour_changes_only() {
        let recorder = Recorder::default();
        let ctrl = FeedbackController::start("cone-1", fast(), recorder.clone()).unwrap();
        ctrl.set_state(FeedbackState::Active);
        std::thread::sleep(Duration::from_millis(30));
        ctrl.shutdown();
        let shown = recorder.0.lock().unwrap().clone();
        assert_eq!(shown.first(), Some(&Rgb::OFF));
        assert!(shown.contains(&Rgb::CYAN));
        assert!(shown.windows(2).all(|w| w[0] != w[1]), "{shown:?}");
    }
}
