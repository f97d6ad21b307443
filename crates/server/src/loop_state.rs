//! Bounded auto-continuation for long workflows.
//!
//! While the loop is active, each Stop request from the harness is blocked
//! with a continue message until either the iteration bound is hit or the
//! tracked progress document contains the completion marker. The loop
//! state round-trips through a frontmatter block at the top of that
//! document so a human can inspect or hand-edit it between runs.

use std::path::{Path, PathBuf};

/// Collaborator-supplied loop configuration (in-memory only; the core
/// reads no config files).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// The progress document the workflow is expected to keep updated.
    pub progress_path: PathBuf,
    /// Reason text returned with each blocked Stop.
    pub continue_message: String,
    pub max_iterations: u32,
    pub completion_marker: String,
}

/// The persisted field set. Round-trip fidelity of these four fields is
/// the contract; the markup is incidental.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_marker: String,
    pub active: bool,
}

/// What the state machine decided for one Stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Loop not running; the Stop is none of our business.
    Inactive,
    /// Stop blocked; the session should keep working.
    Continue { iteration: u32 },
    /// Terminal condition hit; the loop deactivated on this Stop.
    Ended {
        reason: LoopEndReason,
        iteration: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEndReason {
    IterationLimit,
    CompletionMarker,
}

impl LoopEndReason {
    pub fn describe(self) -> &'static str {
        match self {
            LoopEndReason::IterationLimit => "iteration limit reached",
            LoopEndReason::CompletionMarker => "completion marker found",
        }
    }
}

/// A progress-document write the caller should flush asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentWrite {
    pub path: PathBuf,
    pub contents: String,
}

/// The loop state machine. Owned by the decision engine; deactivation
/// happens exactly once per terminal condition.
#[derive(Debug)]
pub struct LoopRunner {
    config: LoopConfig,
    state: LoopState,
}

impl LoopRunner {
    /// Start a fresh loop at iteration zero.
    pub fn new(config: LoopConfig) -> Self {
        let state = LoopState {
            iteration: 0,
            max_iterations: config.max_iterations,
            completion_marker: config.completion_marker.clone(),
            active: true,
        };
        LoopRunner { config, state }
    }

    /// Start a loop, restoring iteration/active from an existing progress
    /// document's frontmatter when present.
    pub fn resume(config: LoopConfig) -> Self {
        let mut runner = LoopRunner::new(config);
        if let Ok(text) = std::fs::read_to_string(&runner.config.progress_path) {
            if let (Some(saved), _) = parse_document(&text) {
                runner.state.iteration = saved.iteration;
                runner.state.active = saved.active;
            }
        }
        runner
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn iteration(&self) -> u32 {
        self.state.iteration
    }

    /// Consult the machine for one Stop request.
    ///
    /// Returns the outcome plus the frontmatter write to flush. The write
    /// is fire-and-forget for the caller; the in-memory state is already
    /// authoritative.
    pub fn on_stop(&mut self) -> (StopOutcome, Option<DocumentWrite>) {
        if !self.state.active {
            return (StopOutcome::Inactive, None);
        }

        let text = std::fs::read_to_string(&self.config.progress_path).unwrap_or_default();
        let (_, body) = parse_document(&text);

        if !self.state.completion_marker.is_empty() && body.contains(&self.state.completion_marker)
        {
            self.state.active = false;
            return (
                StopOutcome::Ended {
                    reason: LoopEndReason::CompletionMarker,
                    iteration: self.state.iteration,
                },
                Some(self.render_write(body)),
            );
        }

        if self.state.iteration >= self.state.max_iterations {
            self.state.active = false;
            return (
                StopOutcome::Ended {
                    reason: LoopEndReason::IterationLimit,
                    iteration: self.state.iteration,
                },
                Some(self.render_write(body)),
            );
        }

        self.state.iteration += 1;
        (
            StopOutcome::Continue {
                iteration: self.state.iteration,
            },
            Some(self.render_write(body)),
        )
    }

    pub fn continue_message(&self) -> &str {
        &self.config.continue_message
    }

    fn render_write(&self, body: &str) -> DocumentWrite {
        DocumentWrite {
            path: self.config.progress_path.clone(),
            contents: render_document(&self.state, body),
        }
    }
}

const FENCE: &str = "---";

/// Split a progress document into its loop frontmatter and body.
///
/// Unknown keys and malformed lines inside the block are ignored; a
/// document without a complete, parseable block yields `(None, text)`.
pub fn parse_document(text: &str) -> (Option<LoopState>, &str) {
    let rest = match text.strip_prefix(FENCE) {
        Some(rest) => rest.strip_prefix('\n').unwrap_or(rest),
        None => return (None, text),
    };

    let Some(end) = rest.find(&format!("\n{FENCE}")) else {
        return (None, text);
    };
    let block = &rest[..end];
    let mut body = &rest[end + FENCE.len() + 1..];
    body = body.strip_prefix('\n').unwrap_or(body);

    let mut iteration = None;
    let mut max_iterations = None;
    let mut completion_marker = None;
    let mut active = None;

    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "iteration" => iteration = value.parse().ok(),
            "max_iterations" => max_iterations = value.parse().ok(),
            "completion_marker" => completion_marker = Some(value.to_string()),
            "active" => active = value.parse().ok(),
            _ => {}
        }
    }

    match (iteration, max_iterations, completion_marker, active) {
        (Some(iteration), Some(max_iterations), Some(completion_marker), Some(active)) => (
            Some(LoopState {
                iteration,
                max_iterations,
                completion_marker,
                active,
            }),
            body,
        ),
        _ => (None, text),
    }
}

/// Render the frontmatter block followed by the untouched body.
pub fn render_document(state: &LoopState, body: &str) -> String {
    format!(
        "{FENCE}\niteration: {}\nmax_iterations: {}\ncompletion_marker: {}\nactive: {}\n{FENCE}\n{}",
        state.iteration, state.max_iterations, state.completion_marker, state.active, body
    )
}
