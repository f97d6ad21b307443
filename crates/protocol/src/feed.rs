//! Persisted domain events describing what happened in a session,
//! independent of the wire format.
//!
//! Feed events are constructed exclusively by the server's feed mapper,
//! persisted in order, and never mutated afterwards (decisions and late
//! transcript text arrive as separate events linked through [`Cause`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::DecisionSource;

/// Logical originators of feed events.
pub mod actor {
    pub const USER: &str = "user";
    pub const AGENT: &str = "agent";
    pub const SYSTEM: &str = "system";

    pub fn subagent(agent_id: &str) -> String {
        format!("subagent/{agent_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Correlation back to whatever caused this event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cause {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

impl Cause {
    pub fn from_request(request_id: &str) -> Self {
        Cause {
            hook_request_id: Some(request_id.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parent_event_id.is_none()
            && self.hook_request_id.is_none()
            && self.tool_use_id.is_none()
            && self.transcript_path.is_none()
    }
}

/// One persisted domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub event_id: String,
    /// Process-lifetime monotonic, globally unique per session: no gaps,
    /// no duplicates, including across restarts.
    pub seq: u64,
    pub ts: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub actor_id: String,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Cause>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Opaque rendering hints for the dashboard.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,
    /// Raw hook payload, kept verbatim where fidelity matters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(flatten)]
    pub data: FeedData,
}

/// Kind-specific payload, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum FeedData {
    #[serde(rename = "session.start")]
    SessionStart(SessionStartData),
    #[serde(rename = "session.end")]
    SessionEnd(SessionEndData),
    #[serde(rename = "run.start")]
    RunStart(RunStartData),
    #[serde(rename = "run.end")]
    RunEnd(RunEndData),
    #[serde(rename = "tool.start")]
    ToolStart(ToolStartData),
    #[serde(rename = "tool.finish")]
    ToolFinish(ToolFinishData),
    #[serde(rename = "tool.error")]
    ToolError(ToolErrorData),
    #[serde(rename = "permission.request")]
    PermissionRequest(PermissionRequestData),
    #[serde(rename = "permission.decision")]
    PermissionDecision(PermissionDecisionData),
    #[serde(rename = "question.decision")]
    QuestionDecision(QuestionDecisionData),
    #[serde(rename = "stop.request")]
    StopRequest(StopRequestData),
    #[serde(rename = "stop.decision")]
    StopDecision(StopDecisionData),
    #[serde(rename = "subagent.start")]
    SubagentStart(SubagentStartData),
    #[serde(rename = "subagent.stop")]
    SubagentStop(SubagentStopData),
    #[serde(rename = "notification")]
    Notification(NotificationData),
    #[serde(rename = "compaction")]
    Compaction(CompactionData),
    #[serde(rename = "setup")]
    Setup(SetupData),
    #[serde(rename = "unknown.hook")]
    UnknownHook(UnknownHookData),
    #[serde(rename = "todo.update")]
    TodoUpdate(TodoUpdateData),
    #[serde(rename = "agent.message")]
    AgentMessage(AgentMessageData),
}

impl FeedData {
    /// The stable kind discriminant, as persisted and serialized.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedData::SessionStart(_) => "session.start",
            FeedData::SessionEnd(_) => "session.end",
            FeedData::RunStart(_) => "run.start",
            FeedData::RunEnd(_) => "run.end",
            FeedData::ToolStart(_) => "tool.start",
            FeedData::ToolFinish(_) => "tool.finish",
            FeedData::ToolError(_) => "tool.error",
            FeedData::PermissionRequest(_) => "permission.request",
            FeedData::PermissionDecision(_) => "permission.decision",
            FeedData::QuestionDecision(_) => "question.decision",
            FeedData::StopRequest(_) => "stop.request",
            FeedData::StopDecision(_) => "stop.decision",
            FeedData::SubagentStart(_) => "subagent.start",
            FeedData::SubagentStop(_) => "subagent.stop",
            FeedData::Notification(_) => "notification",
            FeedData::Compaction(_) => "compaction",
            FeedData::Setup(_) => "setup",
            FeedData::UnknownHook(_) => "unknown.hook",
            FeedData::TodoUpdate(_) => "todo.update",
            FeedData::AgentMessage(_) => "agent.message",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStartData {
    /// The harness-assigned session id observed on this start.
    pub adapter_session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEndData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Attached later by the transcript-parse callback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<TranscriptSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStartData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunEndData {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStartData {
    pub tool_name: String,
    /// Shared by this tool's pre/post/failure events.
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFinishData {
    pub tool_name: String,
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorData {
    pub tool_name: String,
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequestData {
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Which gate produced a permission verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionGate {
    Permission,
    PreTool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDecisionData {
    pub gate: PermissionGate,
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionDecisionData {
    pub answers: HashMap<String, String>,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopRequestData {
    #[serde(default)]
    pub stop_hook_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDecisionData {
    /// Whether the session was pushed to continue or allowed to end.
    pub blocked: bool,
    pub iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source: DecisionSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentStartData {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubagentStopData {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnknownHookData {
    pub hook_event_name: String,
    /// The raw hook payload, verbatim.
    pub payload: Value,
}

/// One entry of the aggregated task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: u64,
    pub subject: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoUpdateData {
    /// Derived snapshot of the full task map after the mutation.
    pub tasks: Vec<TaskItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMessageData {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

/// Result of parsing a harness transcript file.
///
/// This is the whole contract with the transcript parser collaborator;
/// failures degrade into `error`, they never break the event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_assistant_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_assistant_timestamp: Option<String>,
    pub message_count: u64,
    pub tool_call_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: FeedData) -> FeedEvent {
        FeedEvent {
            event_id: crate::new_id(),
            seq: 7,
            ts: "2026-01-01T00:00:00Z".to_string(),
            session_id: "sess".to_string(),
            run_id: Some("run-1".to_string()),
            actor_id: actor::AGENT.to_string(),
            level: EventLevel::Info,
            cause: None,
            title: "title".to_string(),
            body: None,
            ui: None,
            raw: None,
            data,
        }
    }

    #[test]
    fn kind_tag_serializes_with_dots() {
        let ev = event(FeedData::UnknownHook(UnknownHookData {
            hook_event_name: "FutureHookV99".to_string(),
            payload: serde_json::json!({"some_new_field": "value"}),
        }));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "unknown.hook");
        assert_eq!(json["data"]["hook_event_name"], "FutureHookV99");
        assert_eq!(json["data"]["payload"]["some_new_field"], "value");
    }

    #[test]
    fn feed_event_round_trips() {
        let ev = event(FeedData::ToolStart(ToolStartData {
            tool_name: "Bash".to_string(),
            invocation_id: "toolu_01".to_string(),
            input: Some(serde_json::json!({"command": "ls"})),
        }));
        let json = serde_json::to_string(&ev).unwrap();
        let back: FeedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.data.kind(), "tool.start");
    }

    #[test]
    fn decision_payload_round_trips() {
        let ev = event(FeedData::PermissionDecision(PermissionDecisionData {
            gate: PermissionGate::PreTool,
            allow: false,
            reason: Some("denied by rule".to_string()),
            source: DecisionSource::Rule,
        }));
        let json = serde_json::to_string(&ev).unwrap();
        let back: FeedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn subagent_actor_ids_are_namespaced() {
        assert_eq!(actor::subagent("agent-1"), "subagent/agent-1");
    }
}
