//! Operator Console - line commands on the coordinator's stdin
//!
//! ```text
//! start <session-id>        start a stored drill session
//! stop                      stop the active session
//! status                    show the active session
//! nodes                     list every known node
//! threshold <node> <g>      set a node's detection threshold
//! test <node> <secs>        put a node in test mode
//! guided <node>             run guided calibration on a node
//! audio <node> <clip>       play a clip (beep, go, countdown:3, ...)
//! light <node> <state>      set a node's light state (armed, standby, ...)
//! help
//! ```

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, StopOutcome};
use crate::registry::NodeRegistry;
use crate::types::{AudioClip, CalibrateOp, Command, FeedbackState, NodeId};

pub const HELP: &str = "\
commands:
  start <session-id>     start a stored drill session
  stop                   stop the active session
  status                 show the active session
  nodes                  list every known node
  threshold <node> <g>   set a node's detection threshold
  test <node> <secs>     put a node in test mode
  guided <node>          run guided calibration on a node
  audio <node> <clip>    play a clip (beep, go, success, stop, countdown:<n>, elapsed:<ms>)
  light <node> <state>   set a node's light state
  help";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Start { session_id: String },
    Stop,
    Status,
    Nodes,
    Threshold { node: NodeId, threshold_g: f64 },
    Test { node: NodeId, secs: u64 },
    Guided { node: NodeId },
    Audio { node: NodeId, clip: AudioClip },
    Light { node: NodeId, state: FeedbackState },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    #[error("Unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    Invalid(String),
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Err(ConsoleError::Usage("help"));
        };
        match (verb, args) {
            ("start", [id]) => Ok(ConsoleCommand::Start {
                session_id: (*id).to_string(),
            }),
            ("start", _) => Err(ConsoleError::Usage("start <session-id>")),
            ("stop", []) => Ok(ConsoleCommand::Stop),
            ("status", []) => Ok(ConsoleCommand::Status),
            ("nodes", []) => Ok(ConsoleCommand::Nodes),
            ("help" | "?", _) => Ok(ConsoleCommand::Help),
            ("threshold", [node, g]) => {
                let threshold_g: f64 = g
                    .parse()
                    .map_err(|_| ConsoleError::Invalid(format!("'{g}' is not a number")))?;
                if !threshold_g.is_finite() || threshold_g <= 0.0 {
                    return Err(ConsoleError::Invalid(format!("threshold must be > 0 (got {g})")));
                }
                Ok(ConsoleCommand::Threshold {
                    node: (*node).to_string(),
                    threshold_g,
                })
            }
            ("threshold", _) => Err(ConsoleError::Usage("threshold <node> <g>")),
            ("test", [node, secs]) => {
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| ConsoleError::Invalid(format!("'{secs}' is not a whole number of seconds")))?;
                Ok(ConsoleCommand::Test {
                    node: (*node).to_string(),
                    secs,
                })
            }
            ("test", _) => Err(ConsoleError::Usage("test <node> <secs>")),
            ("guided", [node]) => Ok(ConsoleCommand::Guided {
                node: (*node).to_string(),
            }),
            ("guided", _) => Err(ConsoleError::Usage("guided <node>")),
            ("audio", [node, clip]) => Ok(ConsoleCommand::Audio {
                node: (*node).to_string(),
                clip: clip.parse().map_err(|e: crate::types::UnknownAudioClip| ConsoleError::Invalid(e.to_string()))?,
            }),
            ("audio", _) => Err(ConsoleError::Usage("audio <node> <clip>")),
            ("light", [node, state]) => Ok(ConsoleCommand::Light {
                node: (*node).to_string(),
                state: state
                    .parse()
                    .map_err(|e: crate::types::UnknownFeedbackState| ConsoleError::Invalid(e.to_string()))?,
            }),
            ("light", _) => Err(ConsoleError::Usage("light <node> <state>")),
            (other, _) => Err(ConsoleError::Unknown(other.to_string())),
        }
    }
}

/// Executes console commands against the coordinator.
#[derive(Clone)]
pub struct Console {
    orchestrator: Orchestrator,
    registry: Arc<NodeRegistry>,
}

impl Console {
    pub fn new(orchestrator: Orchestrator, registry: Arc<NodeRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
        }
    }

    /// Run one command; returns the text to show the operator.
    pub async fn execute(&self, command: ConsoleCommand) -> String {
        match command {
            ConsoleCommand::Start { session_id } => match self.orchestrator.start_session_by_id(&session_id).await {
                Ok(()) => format!("session {session_id} started"),
                Err(e) => format!("cannot start {session_id}: {e}"),
            },
            ConsoleCommand::Stop => match self.orchestrator.stop() {
                StopOutcome::Stopped => "session stopped".to_string(),
                StopOutcome::NotActive => "no active session".to_string(),
            },
            ConsoleCommand::Status => self.status(),
            ConsoleCommand::Nodes => self.nodes(),
            ConsoleCommand::Threshold { node, threshold_g } => self.send(
                &node,
                Command::Calibrate {
                    op: CalibrateOp::SetThreshold { threshold_g },
                },
            ),
            ConsoleCommand::Test { node, secs } => self.send(
                &node,
                Command::Calibrate {
                    op: CalibrateOp::TestMode {
                        duration_ms: secs.saturating_mul(1000),
                    },
                },
            ),
            ConsoleCommand::Guided { node } => self.send(
                &node,
                Command::Calibrate {
                    op: CalibrateOp::Guided,
                },
            ),
            ConsoleCommand::Audio { node, clip } => self.send(&node, Command::PlayAudio { clip }),
            ConsoleCommand::Light { node, state } => {
                self.registry.set_feedback_state(&node, state);
                format!("{node}: light -> {state}")
            }
            ConsoleCommand::Help => HELP.to_string(),
        }
    }

    fn send(&self, node: &str, command: Command) -> String {
        let note = if self.registry.is_online(node) {
            ""
        } else {
            " (node offline, delivered when it reconnects)"
        };
        let text = format!("{node}: queued {command}{note}");
        self.registry.send_to_node(node, command);
        text
    }

    fn status(&self) -> String {
        let Some(snapshot) = self.orchestrator.snapshot() else {
            return "idle".to_string();
        };
        let mut out = format!(
            "session {} [{}] targets {}",
            snapshot.session_id,
            snapshot.phase,
            snapshot.targets.join(",")
        );
        if let Some(run) = &snapshot.run {
            let _ = write!(
                out,
                "\n  run {} ({}) {}: {}/{} touches, {} ms, armed {}",
                run.run_id,
                run.athlete,
                run.status,
                run.touches,
                run.permutation.len(),
                run.elapsed_ms,
                run.armed.as_deref().unwrap_or("-"),
            );
        }
        for done in &snapshot.finished {
            let _ = write!(
                out,
                "\n  done {} ({}) {} {}",
                done.id,
                done.athlete,
                done.status,
                done.elapsed_ms
                    .map_or_else(|| done.failure.clone().unwrap_or_default(), |ms| format!("{ms} ms")),
            );
        }
        let _ = write!(out, "\n  queued runs: {}", snapshot.queued);
        out
    }

    fn nodes(&self) -> String {
        let nodes = self.registry.snapshot();
        if nodes.is_empty() {
            return "no nodes yet".to_string();
        }
        let mut out = String::new();
        for node in nodes {
            let _ = writeln!(
                out,
                "{:<14} {:<8} {:<12} rtt {:>6} battery {:>5} light {:<14} threshold {:.3}g{}",
                node.node_id,
                if node.online { "online" } else { "offline" },
                node.status.to_string(),
                node.rtt_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms:.0}ms")),
                node.battery_pct.map_or_else(|| "-".to_string(), |pct| format!("{pct:.0}%")),
                node.rendered_feedback.to_string(),
                node.sensor.threshold_g,
                if node.health.all_ok() { "" } else { " ⚠ health" },
            );
        }
        out.trim_end().to_string()
    }
}

/// Read commands line by line until EOF or cancellation.
pub async fn run_console<R>(console: Console, input: R, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    info!("Operator console ready (type 'help')");
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match line.parse::<ConsoleCommand>() {
                Ok(command) => println!("{}", console.execute(command).await),
                Err(e) => println!("{e}"),
            },
            Ok(None) => {
                info!("Console input closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Console read failed");
                break;
            }
        }
    }
}
