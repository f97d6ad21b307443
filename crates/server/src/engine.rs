//! Decision engine: rule matching, permission/question arbitration, and
//! the Stop-request loop state machine.
//!
//! `evaluate` is a pure function of the event, the ruleset, and the loop
//! state, plus two narrow side effects: tracking the current harness
//! session id and requesting an async transcript parse. Anything it
//! neither decides nor queues falls through to the transport's default
//! passthrough.

use std::collections::HashMap;
use std::collections::VecDeque;

use serde_json::Value;
use tracing::debug;

use athena_protocol::{
    hooks, DecisionIntent, DecisionSource, HookRule, RuleAction, RuntimeDecision, RuntimeEvent,
    QUESTION_TOOL,
};

use crate::loop_state::{DocumentWrite, LoopEndReason, LoopRunner, StopOutcome};

/// Which queue a request was parked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedKind {
    Permission,
    Question,
}

/// A request awaiting external (user) resolution.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Option<Value>,
}

/// Follow-up work the pipeline performs outside the engine.
#[derive(Debug)]
pub enum EngineEffect {
    /// Kick off an async transcript parse; result arrives via callback.
    ParseTranscript { path: String },
    /// Flush updated loop frontmatter, fire-and-forget.
    WriteDocument(DocumentWrite),
    /// The loop deactivated on this Stop (exactly once per terminal
    /// condition); worth a stop.decision event.
    LoopEnded {
        reason: LoopEndReason,
        iteration: u32,
    },
}

/// Result of dispatching one runtime event.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    pub decision: Option<RuntimeDecision>,
    pub queued: Option<QueuedKind>,
    pub effects: Vec<EngineEffect>,
}

impl EngineOutcome {
    /// Whether the engine took ownership of the request.
    pub fn handled(&self) -> bool {
        self.decision.is_some() || self.queued.is_some()
    }
}

/// Per-session decision state. Constructed explicitly and injected, no
/// ambient globals, so tests get isolated instances.
pub struct DecisionEngine {
    rules: Vec<HookRule>,
    loop_runner: Option<LoopRunner>,
    pending_permissions: VecDeque<PendingRequest>,
    pending_questions: VecDeque<PendingRequest>,
    current_adapter_session: Option<String>,
}

impl DecisionEngine {
    pub fn new(rules: Vec<HookRule>, loop_runner: Option<LoopRunner>) -> Self {
        DecisionEngine {
            rules,
            loop_runner,
            pending_permissions: VecDeque::new(),
            pending_questions: VecDeque::new(),
            current_adapter_session: None,
        }
    }

    /// Dispatch one runtime event in priority order.
    pub fn evaluate(&mut self, event: &RuntimeEvent) -> EngineOutcome {
        let mut outcome = EngineOutcome::default();

        match event.hook_name.as_str() {
            hooks::PERMISSION_REQUEST => {
                let Some(tool_name) = event.tool_name.as_deref() else {
                    return outcome;
                };
                match self.match_rules(tool_name) {
                    Some(rule) if rule.action == RuleAction::Deny => {
                        outcome.decision = Some(RuntimeDecision::json(
                            DecisionSource::Rule,
                            DecisionIntent::PermissionDeny {
                                reason: rule_deny_reason(rule, tool_name),
                            },
                        ));
                    }
                    Some(_) => {
                        outcome.decision = Some(RuntimeDecision::json(
                            DecisionSource::Rule,
                            DecisionIntent::PermissionAllow,
                        ));
                    }
                    None => {
                        self.pending_permissions.push_back(PendingRequest {
                            request_id: event.id.clone(),
                            tool_name: tool_name.to_string(),
                            input: event.payload.get("tool_input").cloned(),
                        });
                        outcome.queued = Some(QueuedKind::Permission);
                    }
                }
            }

            hooks::PRE_TOOL_USE => {
                let Some(tool_name) = event.tool_name.as_deref() else {
                    return outcome;
                };

                // The question dialog always goes to a human, rules or not.
                if tool_name == QUESTION_TOOL {
                    self.pending_questions.push_back(PendingRequest {
                        request_id: event.id.clone(),
                        tool_name: tool_name.to_string(),
                        input: event.payload.get("tool_input").cloned(),
                    });
                    outcome.queued = Some(QueuedKind::Question);
                    return outcome;
                }

                // No permission round-trip exists for this hook family, so
                // a miss stays unhandled rather than queueing.
                match self.match_rules(tool_name) {
                    Some(rule) if rule.action == RuleAction::Deny => {
                        outcome.decision = Some(RuntimeDecision::json(
                            DecisionSource::Rule,
                            DecisionIntent::PreToolDeny {
                                reason: rule_deny_reason(rule, tool_name),
                            },
                        ));
                    }
                    Some(_) => {
                        outcome.decision = Some(RuntimeDecision::json(
                            DecisionSource::Rule,
                            DecisionIntent::PreToolAllow,
                        ));
                    }
                    None => {}
                }
            }

            hooks::SESSION_START => {
                self.current_adapter_session = Some(event.session_id.clone());
            }

            hooks::SESSION_END => {
                if let Some(path) = event.context.transcript_path.clone() {
                    outcome.effects.push(EngineEffect::ParseTranscript { path });
                }
            }

            hooks::STOP => {
                if let Some(runner) = self.loop_runner.as_mut() {
                    let (stop, write) = runner.on_stop();
                    let message = runner.continue_message().to_string();
                    if let Some(write) = write {
                        outcome.effects.push(EngineEffect::WriteDocument(write));
                    }
                    match stop {
                        StopOutcome::Continue { iteration } => {
                            debug!(
                                component = "engine",
                                event = "engine.loop_continue",
                                iteration,
                                "Blocking Stop to continue the loop"
                            );
                            outcome.decision = Some(RuntimeDecision::json(
                                DecisionSource::Rule,
                                DecisionIntent::StopBlock { reason: message },
                            ));
                        }
                        StopOutcome::Ended { reason, iteration } => {
                            outcome
                                .effects
                                .push(EngineEffect::LoopEnded { reason, iteration });
                        }
                        StopOutcome::Inactive => {}
                    }
                }
            }

            _ => {}
        }

        outcome
    }

    // -- Rules ----------------------------------------------------------

    /// First matching rule, deny rules always checked before approve rules.
    fn match_rules(&self, tool_name: &str) -> Option<&HookRule> {
        self.rules
            .iter()
            .filter(|r| r.action == RuleAction::Deny)
            .find(|r| r.matches(tool_name))
            .or_else(|| {
                self.rules
                    .iter()
                    .filter(|r| r.action == RuleAction::Approve)
                    .find(|r| r.matches(tool_name))
            })
    }

    pub fn add_rule(&mut self, rule: HookRule) {
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != rule_id);
        self.rules.len() != before
    }

    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[HookRule] {
        &self.rules
    }

    // -- Pending requests ----------------------------------------------

    /// Resolve a queued permission request with a user verdict.
    pub fn resolve_permission(
        &mut self,
        request_id: &str,
        allow: bool,
        reason: Option<String>,
    ) -> Option<RuntimeDecision> {
        take_pending(&mut self.pending_permissions, request_id)?;
        let intent = if allow {
            DecisionIntent::PermissionAllow
        } else {
            DecisionIntent::PermissionDeny {
                reason: reason.unwrap_or_else(|| "Denied by user".to_string()),
            }
        };
        Some(RuntimeDecision::json(DecisionSource::User, intent))
    }

    /// Resolve a queued question dialog with the user's answers.
    pub fn answer_question(
        &mut self,
        request_id: &str,
        answers: HashMap<String, String>,
    ) -> Option<RuntimeDecision> {
        take_pending(&mut self.pending_questions, request_id)?;
        Some(RuntimeDecision::json(
            DecisionSource::User,
            DecisionIntent::QuestionAnswer { answers },
        ))
    }

    /// Head of the permission queue, the request a dialog should show.
    pub fn current_permission(&self) -> Option<&PendingRequest> {
        self.pending_permissions.front()
    }

    pub fn current_question(&self) -> Option<&PendingRequest> {
        self.pending_questions.front()
    }

    pub fn pending_permissions(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending_permissions.iter()
    }

    pub fn pending_questions(&self) -> impl Iterator<Item = &PendingRequest> {
        self.pending_questions.iter()
    }

    /// Drop every queued request (bulk cleanup on client disconnect).
    /// Returns the abandoned request ids.
    pub fn clear_pending(&mut self) -> Vec<String> {
        let ids = self
            .pending_permissions
            .drain(..)
            .chain(self.pending_questions.drain(..))
            .map(|p| p.request_id)
            .collect();
        ids
    }

    // -- Session bookkeeping -------------------------------------------

    pub fn current_adapter_session(&self) -> Option<&str> {
        self.current_adapter_session.as_deref()
    }

    pub fn loop_iteration(&self) -> u32 {
        self.loop_runner.as_ref().map_or(0, LoopRunner::iteration)
    }
}

fn rule_deny_reason(rule: &HookRule, tool_name: &str) -> String {
    format!("Tool '{tool_name}' denied by rule '{}'", rule.tool_name)
}

fn take_pending(queue: &mut VecDeque<PendingRequest>, request_id: &str) -> Option<PendingRequest> {
    let index = queue.iter().position(|p| p.request_id == request_id)?;
    queue.remove(index)
}
