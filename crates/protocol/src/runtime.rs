//! Harness-agnostic runtime form of decoded hook events and the decisions
//! that resolve them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{HookAction, HookEventEnvelope, HookResultPayload};

/// Well-known hook names emitted by the harness.
pub mod hooks {
    pub const SESSION_START: &str = "SessionStart";
    pub const SESSION_END: &str = "SessionEnd";
    pub const USER_PROMPT_SUBMIT: &str = "UserPromptSubmit";
    pub const PRE_TOOL_USE: &str = "PreToolUse";
    pub const POST_TOOL_USE: &str = "PostToolUse";
    pub const POST_TOOL_USE_FAILURE: &str = "PostToolUseFailure";
    pub const PERMISSION_REQUEST: &str = "PermissionRequest";
    pub const STOP: &str = "Stop";
    pub const SUBAGENT_START: &str = "SubagentStart";
    pub const SUBAGENT_STOP: &str = "SubagentStop";
    pub const NOTIFICATION: &str = "Notification";
    pub const PRE_COMPACT: &str = "PreCompact";
    pub const SETUP: &str = "Setup";
}

/// The harness tool that opens an interactive question dialog.
pub const QUESTION_TOOL: &str = "AskUserQuestion";

const SHORT_TIMEOUT_MS: u64 = 5_000;
const TOOL_TIMEOUT_MS: u64 = 60_000;
const HUMAN_TIMEOUT_MS: u64 = 3_600_000;

/// How a hook interacts with the decision path.
///
/// `default_timeout_ms` is advisory metadata enforced by the remote client;
/// the server never arms a timer for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInteraction {
    pub expects_decision: bool,
    pub can_block: bool,
    pub default_timeout_ms: u64,
}

/// Static lookup: hook name → interaction traits.
///
/// Unknown hooks get safe defaults (no decision expected, no blocking,
/// short timeout) so a newer harness never hangs on an older server.
pub fn hook_interaction(hook_name: &str) -> HookInteraction {
    match hook_name {
        hooks::PRE_TOOL_USE => HookInteraction {
            expects_decision: true,
            can_block: true,
            default_timeout_ms: TOOL_TIMEOUT_MS,
        },
        hooks::PERMISSION_REQUEST => HookInteraction {
            expects_decision: true,
            can_block: true,
            default_timeout_ms: HUMAN_TIMEOUT_MS,
        },
        hooks::USER_PROMPT_SUBMIT => HookInteraction {
            expects_decision: true,
            can_block: true,
            default_timeout_ms: SHORT_TIMEOUT_MS,
        },
        hooks::STOP => HookInteraction {
            expects_decision: true,
            can_block: true,
            default_timeout_ms: TOOL_TIMEOUT_MS,
        },
        hooks::SESSION_START
        | hooks::SESSION_END
        | hooks::POST_TOOL_USE
        | hooks::POST_TOOL_USE_FAILURE
        | hooks::SUBAGENT_START
        | hooks::SUBAGENT_STOP
        | hooks::NOTIFICATION
        | hooks::PRE_COMPACT
        | hooks::SETUP => HookInteraction {
            expects_decision: false,
            can_block: false,
            default_timeout_ms: SHORT_TIMEOUT_MS,
        },
        _ => HookInteraction {
            expects_decision: false,
            can_block: false,
            default_timeout_ms: SHORT_TIMEOUT_MS,
        },
    }
}

/// Where the event came from on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

/// Ephemeral, harness-agnostic form of one decoded hook event.
///
/// Created per inbound connection, discarded once mapped and persisted,
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Request correlation id (the envelope's `request_id`).
    pub id: String,
    pub timestamp: String,
    pub hook_name: String,
    /// Harness-assigned session id.
    pub session_id: String,
    pub context: EventContext,
    pub interaction: HookInteraction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub payload: Value,
}

impl RuntimeEvent {
    /// Build a runtime event from a validated wire envelope.
    pub fn from_envelope(envelope: HookEventEnvelope) -> Self {
        let payload = envelope.payload;
        let str_field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        RuntimeEvent {
            id: envelope.request_id,
            timestamp: envelope.ts,
            hook_name: envelope.hook_event_name.clone(),
            session_id: envelope.session_id,
            context: EventContext {
                cwd: str_field("cwd"),
                transcript_path: str_field("transcript_path"),
            },
            interaction: hook_interaction(&envelope.hook_event_name),
            tool_name: str_field("tool_name"),
            tool_use_id: str_field("tool_use_id"),
            payload,
        }
    }
}

/// Who produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    User,
    Rule,
    Timeout,
}

/// Structured outcome carried by a `json` decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionIntent {
    PermissionAllow,
    PermissionDeny { reason: String },
    PreToolAllow,
    PreToolDeny { reason: String },
    QuestionAnswer { answers: HashMap<String, String> },
    StopBlock { reason: String },
}

/// How a pending hook request is resolved. Produced at most once per
/// runtime event; never retracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDecision {
    pub source: DecisionSource,
    #[serde(flatten)]
    pub action: DecisionAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionAction {
    Passthrough,
    Block { reason: String },
    Json { intent: DecisionIntent },
}

impl RuntimeDecision {
    pub fn passthrough(source: DecisionSource) -> Self {
        RuntimeDecision {
            source,
            action: DecisionAction::Passthrough,
        }
    }

    pub fn block(source: DecisionSource, reason: impl Into<String>) -> Self {
        RuntimeDecision {
            source,
            action: DecisionAction::Block {
                reason: reason.into(),
            },
        }
    }

    pub fn json(source: DecisionSource, intent: DecisionIntent) -> Self {
        RuntimeDecision {
            source,
            action: DecisionAction::Json { intent },
        }
    }

    /// Map the decision onto the wire `hook_result` payload.
    pub fn to_result_payload(&self) -> HookResultPayload {
        match &self.action {
            DecisionAction::Passthrough => HookResultPayload {
                action: HookAction::Passthrough,
                stderr: None,
                stdout_json: None,
            },
            DecisionAction::Block { reason } => HookResultPayload {
                action: HookAction::BlockWithStderr,
                stderr: Some(reason.clone()),
                stdout_json: None,
            },
            DecisionAction::Json { intent } => HookResultPayload {
                action: HookAction::JsonOutput,
                stderr: None,
                stdout_json: Some(intent.to_stdout_json()),
            },
        }
    }
}

impl DecisionIntent {
    /// The intent-specific JSON the harness reads from the hook's stdout.
    pub fn to_stdout_json(&self) -> Value {
        match self {
            DecisionIntent::PermissionAllow => serde_json::json!({
                "hookSpecificOutput": {"decision": "allow"}
            }),
            DecisionIntent::PermissionDeny { reason } => serde_json::json!({
                "hookSpecificOutput": {"decision": "deny", "reason": reason}
            }),
            DecisionIntent::PreToolAllow => serde_json::json!({
                "hookSpecificOutput": {"permissionDecision": "allow"}
            }),
            DecisionIntent::PreToolDeny { reason } => serde_json::json!({
                "hookSpecificOutput": {
                    "permissionDecision": "deny",
                    "permissionDecisionReason": reason,
                }
            }),
            DecisionIntent::QuestionAnswer { answers } => serde_json::json!({
                "hookSpecificOutput": {"updatedInput": {"answers": answers}}
            }),
            DecisionIntent::StopBlock { reason } => serde_json::json!({
                "decision": "block",
                "reason": reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_hook_gets_safe_defaults() {
        let traits = hook_interaction("FutureHookV99");
        assert!(!traits.expects_decision);
        assert!(!traits.can_block);
        assert_eq!(traits.default_timeout_ms, SHORT_TIMEOUT_MS);
    }

    #[test]
    fn permission_request_waits_on_a_human() {
        let traits = hook_interaction(hooks::PERMISSION_REQUEST);
        assert!(traits.expects_decision);
        assert!(traits.can_block);
        assert_eq!(traits.default_timeout_ms, HUMAN_TIMEOUT_MS);
    }

    #[test]
    fn runtime_event_pulls_tool_fields_from_payload() {
        let envelope = HookEventEnvelope {
            version: crate::envelope::PROTOCOL_VERSION,
            kind: "hook_event".to_string(),
            request_id: "req-9".to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            session_id: "sess".to_string(),
            hook_event_name: hooks::PRE_TOOL_USE.to_string(),
            payload: serde_json::json!({
                "tool_name": "Bash",
                "tool_use_id": "toolu_01",
                "cwd": "/work",
            }),
        };

        let event = RuntimeEvent::from_envelope(envelope);
        assert_eq!(event.tool_name.as_deref(), Some("Bash"));
        assert_eq!(event.tool_use_id.as_deref(), Some("toolu_01"));
        assert_eq!(event.context.cwd.as_deref(), Some("/work"));
        assert!(event.interaction.expects_decision);
    }

    #[test]
    fn block_decision_maps_to_stderr() {
        let payload = RuntimeDecision::block(DecisionSource::Rule, "nope").to_result_payload();
        assert_eq!(payload.action, HookAction::BlockWithStderr);
        assert_eq!(payload.stderr.as_deref(), Some("nope"));
        assert!(payload.stdout_json.is_none());
    }

    #[test]
    fn permission_deny_shape() {
        let intent = DecisionIntent::PermissionDeny {
            reason: "blocked by rule".to_string(),
        };
        let json = intent.to_stdout_json();
        assert_eq!(json["hookSpecificOutput"]["decision"], "deny");
        assert_eq!(json["hookSpecificOutput"]["reason"], "blocked by rule");
    }

    #[test]
    fn pre_tool_deny_shape() {
        let intent = DecisionIntent::PreToolDeny {
            reason: "not here".to_string(),
        };
        let json = intent.to_stdout_json();
        assert_eq!(json["hookSpecificOutput"]["permissionDecision"], "deny");
        assert_eq!(
            json["hookSpecificOutput"]["permissionDecisionReason"],
            "not here"
        );
    }

    #[test]
    fn question_answers_round_trip_through_updated_input() {
        let mut answers = HashMap::new();
        answers.insert("q1".to_string(), "yes".to_string());
        let intent = DecisionIntent::QuestionAnswer { answers };
        let json = intent.to_stdout_json();
        assert_eq!(
            json["hookSpecificOutput"]["updatedInput"]["answers"]["q1"],
            "yes"
        );
    }

    #[test]
    fn stop_block_shape() {
        let intent = DecisionIntent::StopBlock {
            reason: "keep going".to_string(),
        };
        let json = intent.to_stdout_json();
        assert_eq!(json["decision"], "block");
        assert_eq!(json["reason"], "keep going");
    }
}
