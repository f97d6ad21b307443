//! Feed mapper: the only component that constructs feed events.
//!
//! Holds the process-local ordering state: the seq counter, the open run,
//! the subagent actor scope, tool pre/post correlation, and the aggregated
//! task map. Can be bootstrapped from a store checkpoint so a resumed
//! session keeps numbering with no gaps or duplicates and without
//! reprocessing history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tracing::debug;

use athena_protocol::{
    actor, hooks, new_id, AgentMessageData, Cause, CompactionData, DecisionAction, DecisionIntent,
    EventLevel, FeedData, FeedEvent, NotificationData, PermissionDecisionData, PermissionGate,
    PermissionRequestData, QuestionDecisionData, RunEndData, RunStartData, RuntimeDecision,
    RuntimeEvent, SessionEndData, SessionStartData, SetupData, StopDecisionData, StopRequestData,
    SubagentStartData, SubagentStopData, TaskItem, TodoUpdateData, ToolErrorData, ToolFinishData,
    ToolStartData, TranscriptSummary, UnknownHookData,
};

use crate::time::now_iso8601;

/// Task-list management tools are aggregated, never emitted as discrete
/// tool events.
const TASK_CREATE_TOOL: &str = "TaskCreate";
const TASK_UPDATE_TOOL: &str = "TaskUpdate";

/// Mapper bootstrap data recovered from the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapperCheckpoint {
    /// Highest seq ever assigned for this session (0 if none).
    pub max_seq: u64,
    pub open_run: Option<String>,
    pub known_subagents: Vec<String>,
}

pub struct FeedMapper {
    session_id: String,
    next_seq: u64,
    run_id: Option<String>,
    /// Active subagents, innermost last. Events map to the innermost scope.
    subagents: Vec<String>,
    /// invocation correlation for tools whose hooks carry no tool_use_id,
    /// keyed by tool name (pre pushes, post/failure pops).
    anonymous_invocations: HashMap<String, VecDeque<String>>,
    tasks: BTreeMap<u64, TaskItem>,
    next_task_id: u64,
    task_snapshot: Arc<ArcSwap<Vec<TaskItem>>>,
}

impl FeedMapper {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_checkpoint(session_id, MapperCheckpoint::default())
    }

    /// Resume numbering and scope from a store checkpoint.
    pub fn with_checkpoint(session_id: impl Into<String>, checkpoint: MapperCheckpoint) -> Self {
        FeedMapper {
            session_id: session_id.into(),
            next_seq: checkpoint.max_seq + 1,
            run_id: checkpoint.open_run,
            subagents: checkpoint.known_subagents,
            anonymous_invocations: HashMap::new(),
            tasks: BTreeMap::new(),
            next_task_id: 1,
            task_snapshot: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }

    /// Lock-free handle to the derived task-list snapshot.
    pub fn task_snapshot_handle(&self) -> Arc<ArcSwap<Vec<TaskItem>>> {
        Arc::clone(&self.task_snapshot)
    }

    pub fn tasks(&self) -> Vec<TaskItem> {
        self.tasks.values().cloned().collect()
    }

    pub fn open_run(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Map one runtime event into zero or more ordered feed events.
    ///
    /// Every hook name missing from this table still yields exactly one
    /// `unknown.hook` event (deliberate fail-open forward compatibility).
    pub fn map_event(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        let mut out = Vec::new();
        let ts = event.timestamp.clone();
        let cause = Cause {
            hook_request_id: Some(event.id.clone()),
            ..Default::default()
        };

        match event.hook_name.as_str() {
            hooks::SESSION_START => {
                let data = SessionStartData {
                    adapter_session_id: event.session_id.clone(),
                    source: payload_str(&event.payload, "source"),
                    cwd: event.context.cwd.clone(),
                    model: payload_str(&event.payload, "model"),
                };
                out.push(self.next_event(
                    &ts,
                    actor::SYSTEM.to_string(),
                    EventLevel::Info,
                    Some(cause),
                    "Session started".to_string(),
                    None,
                    None,
                    FeedData::SessionStart(data),
                ));
            }

            hooks::SESSION_END => {
                if self.run_id.is_some() {
                    out.push(self.close_run(&ts, &event.id));
                }
                out.push(self.next_event(
                    &ts,
                    actor::SYSTEM.to_string(),
                    EventLevel::Info,
                    Some(cause),
                    "Session ended".to_string(),
                    None,
                    None,
                    FeedData::SessionEnd(SessionEndData {
                        reason: payload_str(&event.payload, "reason"),
                        summary: None,
                    }),
                ));
            }

            hooks::USER_PROMPT_SUBMIT => {
                if self.run_id.is_some() {
                    out.push(self.close_run(&ts, &event.id));
                }
                // The submit's request id doubles as the run id, keeping
                // replays of the same runtime stream structurally equal.
                self.run_id = Some(event.id.clone());
                let prompt = payload_str(&event.payload, "prompt");
                out.push(self.next_event(
                    &ts,
                    actor::USER.to_string(),
                    EventLevel::Info,
                    Some(cause),
                    "Prompt submitted".to_string(),
                    prompt.clone(),
                    None,
                    FeedData::RunStart(RunStartData { prompt }),
                ));
            }

            hooks::PRE_TOOL_USE => {
                let tool_name = event.tool_name.clone().unwrap_or_default();
                if tool_name == TASK_CREATE_TOOL || tool_name == TASK_UPDATE_TOOL {
                    if let Some(ev) = self.apply_task_mutation(event, &ts) {
                        out.push(ev);
                    }
                } else if !tool_name.is_empty() {
                    let invocation_id = self.open_invocation(event, &tool_name);
                    let input = event.payload.get("tool_input").cloned();
                    let title = tool_title(&tool_name, input.as_ref());
                    out.push(self.next_event(
                        &ts,
                        self.current_actor(),
                        EventLevel::Info,
                        Some(Cause {
                            hook_request_id: Some(event.id.clone()),
                            tool_use_id: Some(invocation_id.clone()),
                            ..Default::default()
                        }),
                        title,
                        None,
                        None,
                        FeedData::ToolStart(ToolStartData {
                            tool_name,
                            invocation_id,
                            input,
                        }),
                    ));
                }
            }

            hooks::POST_TOOL_USE => {
                let tool_name = event.tool_name.clone().unwrap_or_default();
                if tool_name != TASK_CREATE_TOOL
                    && tool_name != TASK_UPDATE_TOOL
                    && !tool_name.is_empty()
                {
                    let invocation_id = self.close_invocation(event, &tool_name);
                    out.push(self.next_event(
                        &ts,
                        self.current_actor(),
                        EventLevel::Info,
                        Some(Cause {
                            hook_request_id: Some(event.id.clone()),
                            tool_use_id: Some(invocation_id.clone()),
                            ..Default::default()
                        }),
                        format!("{tool_name} finished"),
                        None,
                        None,
                        FeedData::ToolFinish(ToolFinishData {
                            tool_name,
                            invocation_id,
                            output: event.payload.get("tool_response").cloned(),
                        }),
                    ));
                }
            }

            hooks::POST_TOOL_USE_FAILURE => {
                let tool_name = event.tool_name.clone().unwrap_or_default();
                if !tool_name.is_empty() {
                    let invocation_id = self.close_invocation(event, &tool_name);
                    out.push(self.next_event(
                        &ts,
                        self.current_actor(),
                        EventLevel::Error,
                        Some(Cause {
                            hook_request_id: Some(event.id.clone()),
                            tool_use_id: Some(invocation_id.clone()),
                            ..Default::default()
                        }),
                        format!("{tool_name} failed"),
                        None,
                        None,
                        FeedData::ToolError(ToolErrorData {
                            tool_name,
                            invocation_id,
                            error: payload_str(&event.payload, "error"),
                        }),
                    ));
                }
            }

            hooks::PERMISSION_REQUEST => {
                let tool_name = event
                    .tool_name
                    .clone()
                    .unwrap_or_else(|| "unknown tool".to_string());
                out.push(self.next_event(
                    &ts,
                    self.current_actor(),
                    EventLevel::Warn,
                    Some(cause),
                    format!("Permission requested: {tool_name}"),
                    None,
                    None,
                    FeedData::PermissionRequest(PermissionRequestData {
                        tool_name,
                        input: event.payload.get("tool_input").cloned(),
                    }),
                ));
            }

            hooks::STOP => {
                out.push(self.next_event(
                    &ts,
                    self.current_actor(),
                    EventLevel::Info,
                    Some(cause),
                    "Stop requested".to_string(),
                    None,
                    None,
                    FeedData::StopRequest(StopRequestData {
                        stop_hook_active: event
                            .payload
                            .get("stop_hook_active")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    }),
                ));
            }

            hooks::SUBAGENT_START => {
                let agent_id = payload_str(&event.payload, "agent_id").unwrap_or_else(new_id);
                let agent_type = payload_str(&event.payload, "agent_type");
                let title = match &agent_type {
                    Some(t) => format!("Subagent started: {t}"),
                    None => "Subagent started".to_string(),
                };
                out.push(self.next_event(
                    &ts,
                    self.current_actor(),
                    EventLevel::Info,
                    Some(cause),
                    title,
                    None,
                    None,
                    FeedData::SubagentStart(SubagentStartData {
                        agent_id: agent_id.clone(),
                        agent_type,
                    }),
                ));
                self.subagents.push(agent_id);
            }

            hooks::SUBAGENT_STOP => {
                let agent_id = payload_str(&event.payload, "agent_id")
                    .or_else(|| self.subagents.last().cloned())
                    .unwrap_or_default();
                // Close the matched scope before attributing the event.
                self.subagents.retain(|id| *id != agent_id);
                out.push(self.next_event(
                    &ts,
                    self.current_actor(),
                    EventLevel::Info,
                    Some(cause),
                    "Subagent stopped".to_string(),
                    None,
                    None,
                    FeedData::SubagentStop(SubagentStopData {
                        agent_id,
                        transcript_path: payload_str(&event.payload, "agent_transcript_path"),
                    }),
                ));
            }

            hooks::NOTIFICATION => {
                let notification_type = payload_str(&event.payload, "notification_type");
                let message = payload_str(&event.payload, "message");
                let title = match &notification_type {
                    Some(t) => format!("Notification: {t}"),
                    None => "Notification".to_string(),
                };
                out.push(self.next_event(
                    &ts,
                    actor::SYSTEM.to_string(),
                    EventLevel::Info,
                    Some(cause),
                    title,
                    message.clone(),
                    None,
                    FeedData::Notification(NotificationData {
                        notification_type,
                        message,
                    }),
                ));
            }

            hooks::PRE_COMPACT => {
                out.push(self.next_event(
                    &ts,
                    actor::SYSTEM.to_string(),
                    EventLevel::Info,
                    Some(cause),
                    "Context compaction".to_string(),
                    None,
                    None,
                    FeedData::Compaction(CompactionData {
                        trigger: payload_str(&event.payload, "trigger"),
                    }),
                ));
            }

            hooks::SETUP => {
                out.push(self.next_event(
                    &ts,
                    actor::SYSTEM.to_string(),
                    EventLevel::Info,
                    Some(cause),
                    "Setup".to_string(),
                    None,
                    None,
                    FeedData::Setup(SetupData {
                        phase: payload_str(&event.payload, "phase"),
                    }),
                ));
            }

            unknown => {
                debug!(
                    component = "mapper",
                    event = "mapper.unknown_hook",
                    hook_name = unknown,
                    "Mapping unrecognized hook as unknown.hook"
                );
                out.push(self.next_event(
                    &ts,
                    actor::SYSTEM.to_string(),
                    EventLevel::Info,
                    Some(cause),
                    format!("Unknown hook: {unknown}"),
                    None,
                    Some(event.payload.clone()),
                    FeedData::UnknownHook(UnknownHookData {
                        hook_event_name: unknown.to_string(),
                        payload: event.payload.clone(),
                    }),
                ));
            }
        }

        out
    }

    /// Map a resolved decision into its `*.decision` event, linked to the
    /// originating feed event.
    pub fn map_decision(
        &mut self,
        parent: &FeedEvent,
        request_id: &str,
        decision: &RuntimeDecision,
        loop_iteration: u32,
    ) -> Option<FeedEvent> {
        let DecisionAction::Json { intent } = &decision.action else {
            return None;
        };

        let cause = Cause {
            parent_event_id: Some(parent.event_id.clone()),
            hook_request_id: Some(request_id.to_string()),
            ..Default::default()
        };
        let ts = now_iso8601();

        let (title, data) = match intent {
            DecisionIntent::PermissionAllow => (
                "Permission allowed".to_string(),
                FeedData::PermissionDecision(PermissionDecisionData {
                    gate: PermissionGate::Permission,
                    allow: true,
                    reason: None,
                    source: decision.source,
                }),
            ),
            DecisionIntent::PermissionDeny { reason } => (
                "Permission denied".to_string(),
                FeedData::PermissionDecision(PermissionDecisionData {
                    gate: PermissionGate::Permission,
                    allow: false,
                    reason: Some(reason.clone()),
                    source: decision.source,
                }),
            ),
            DecisionIntent::PreToolAllow => (
                "Tool allowed".to_string(),
                FeedData::PermissionDecision(PermissionDecisionData {
                    gate: PermissionGate::PreTool,
                    allow: true,
                    reason: None,
                    source: decision.source,
                }),
            ),
            DecisionIntent::PreToolDeny { reason } => (
                "Tool denied".to_string(),
                FeedData::PermissionDecision(PermissionDecisionData {
                    gate: PermissionGate::PreTool,
                    allow: false,
                    reason: Some(reason.clone()),
                    source: decision.source,
                }),
            ),
            DecisionIntent::QuestionAnswer { answers } => (
                "Question answered".to_string(),
                FeedData::QuestionDecision(QuestionDecisionData {
                    answers: answers.clone(),
                    source: decision.source,
                }),
            ),
            DecisionIntent::StopBlock { reason } => (
                "Stop blocked: continuing".to_string(),
                FeedData::StopDecision(StopDecisionData {
                    blocked: true,
                    iteration: loop_iteration,
                    reason: Some(reason.clone()),
                    source: decision.source,
                }),
            ),
        };

        Some(self.next_event(
            &ts,
            self.current_actor(),
            EventLevel::Info,
            Some(cause),
            title,
            None,
            None,
            data,
        ))
    }

    /// A Stop the loop released (terminal condition) still gets a
    /// decision event so the stream records why the session was let go.
    pub fn stop_released(&mut self, parent: &FeedEvent, iteration: u32, reason: &str) -> FeedEvent {
        let ts = now_iso8601();
        self.next_event(
            &ts,
            self.current_actor(),
            EventLevel::Info,
            Some(Cause {
                parent_event_id: Some(parent.event_id.clone()),
                hook_request_id: parent.cause.as_ref().and_then(|c| c.hook_request_id.clone()),
                ..Default::default()
            }),
            "Stop allowed: session ending".to_string(),
            None,
            None,
            FeedData::StopDecision(StopDecisionData {
                blocked: false,
                iteration,
                reason: Some(reason.to_string()),
                source: athena_protocol::DecisionSource::Rule,
            }),
        )
    }

    /// Late transcript text becomes an `agent.message` in the ordered
    /// stream, linked to the event whose parse produced it.
    pub fn agent_message(
        &mut self,
        parent_event_id: &str,
        transcript_path: Option<String>,
        summary: &TranscriptSummary,
    ) -> Option<FeedEvent> {
        let text = summary.last_assistant_text.clone()?;
        let ts = summary
            .last_assistant_timestamp
            .clone()
            .unwrap_or_else(now_iso8601);
        Some(self.next_event(
            &ts.clone(),
            actor::AGENT.to_string(),
            EventLevel::Info,
            Some(Cause {
                parent_event_id: Some(parent_event_id.to_string()),
                transcript_path,
                ..Default::default()
            }),
            "Agent message".to_string(),
            Some(text.clone()),
            None,
            FeedData::AgentMessage(AgentMessageData { text, ts: Some(ts) }),
        ))
    }

    // -- internals ------------------------------------------------------

    fn close_run(&mut self, ts: &str, request_id: &str) -> FeedEvent {
        let closing = self.run_id.take();
        let mut event = self.next_event(
            ts,
            actor::SYSTEM.to_string(),
            EventLevel::Info,
            Some(Cause {
                hook_request_id: Some(request_id.to_string()),
                ..Default::default()
            }),
            "Run ended".to_string(),
            None,
            None,
            FeedData::RunEnd(RunEndData {}),
        );
        // run.end belongs to the run it closes.
        event.run_id = closing;
        event
    }

    fn open_invocation(&mut self, event: &RuntimeEvent, tool_name: &str) -> String {
        match &event.tool_use_id {
            Some(id) => id.clone(),
            None => {
                // No harness correlation id: the pre-hook's request id
                // stands in, remembered until the matching post arrives.
                let generated = event.id.clone();
                self.anonymous_invocations
                    .entry(tool_name.to_string())
                    .or_default()
                    .push_back(generated.clone());
                generated
            }
        }
    }

    fn close_invocation(&mut self, event: &RuntimeEvent, tool_name: &str) -> String {
        if let Some(id) = &event.tool_use_id {
            return id.clone();
        }
        self.anonymous_invocations
            .get_mut(tool_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| event.id.clone())
    }

    fn apply_task_mutation(&mut self, event: &RuntimeEvent, ts: &str) -> Option<FeedEvent> {
        let input = event.payload.get("tool_input")?;
        let tool_name = event.tool_name.as_deref().unwrap_or_default();

        if tool_name == TASK_CREATE_TOOL {
            let subject = input
                .get("subject")
                .and_then(Value::as_str)
                .unwrap_or("(untitled task)")
                .to_string();
            let id = self.next_task_id;
            self.next_task_id += 1;
            self.tasks.insert(
                id,
                TaskItem {
                    id,
                    subject,
                    status: "pending".to_string(),
                },
            );
        } else {
            let id = input
                .get("taskId")
                .and_then(Value::as_u64)
                .or_else(|| {
                    input
                        .get("taskId")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                })?;
            let status = input.get("status").and_then(Value::as_str);
            if status == Some("deleted") {
                self.tasks.remove(&id);
            } else {
                let task = self.tasks.get_mut(&id)?;
                if let Some(status) = status {
                    task.status = status.to_string();
                }
                if let Some(subject) = input.get("subject").and_then(Value::as_str) {
                    task.subject = subject.to_string();
                }
            }
        }

        let snapshot = self.tasks();
        self.task_snapshot.store(Arc::new(snapshot.clone()));

        let open = snapshot
            .iter()
            .filter(|t| t.status != "completed")
            .count();
        Some(self.next_event(
            ts,
            self.current_actor(),
            EventLevel::Info,
            Some(Cause {
                hook_request_id: Some(event.id.clone()),
                ..Default::default()
            }),
            format!("Task list updated ({open} open)"),
            None,
            None,
            FeedData::TodoUpdate(TodoUpdateData { tasks: snapshot }),
        ))
    }

    fn current_actor(&self) -> String {
        match self.subagents.last() {
            Some(id) => actor::subagent(id),
            None => actor::AGENT.to_string(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn next_event(
        &mut self,
        ts: &str,
        actor_id: String,
        level: EventLevel,
        cause: Option<Cause>,
        title: String,
        body: Option<String>,
        raw: Option<Value>,
        data: FeedData,
    ) -> FeedEvent {
        let seq = self.next_seq;
        self.next_seq += 1;
        FeedEvent {
            event_id: new_id(),
            seq,
            ts: ts.to_string(),
            session_id: self.session_id.clone(),
            run_id: self.run_id.clone(),
            actor_id,
            level,
            cause: cause.filter(|c| !c.is_empty()),
            title,
            body,
            ui: None,
            raw,
            data,
        }
    }
}

fn payload_str(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Human-readable title for a tool invocation.
fn tool_title(tool_name: &str, input: Option<&Value>) -> String {
    let summary = tool_summary(tool_name, input);
    if summary == tool_name {
        tool_name.to_string()
    } else {
        format!("{tool_name}: {summary}")
    }
}

/// Create a short summary for a tool call from its input.
fn tool_summary(tool_name: &str, input: Option<&Value>) -> String {
    let Some(input) = input else {
        return tool_name.to_string();
    };

    match tool_name.to_lowercase().as_str() {
        "read" | "edit" | "write" => {
            if let Some(path) = input.get("file_path").and_then(Value::as_str) {
                return shorten_path(path);
            }
        }
        "bash" => {
            if let Some(cmd) = input.get("command").and_then(Value::as_str) {
                let flattened = cmd.replace('\n', " ");
                return if flattened.len() > 60 {
                    format!("{}...", &flattened[..60])
                } else {
                    flattened
                };
            }
        }
        "glob" | "grep" => {
            if let Some(pattern) = input.get("pattern").and_then(Value::as_str) {
                return pattern.to_string();
            }
        }
        "task" => {
            if let Some(prompt) = input.get("prompt").and_then(Value::as_str) {
                if prompt.len() > 50 {
                    return format!("{}...", &prompt[..50]);
                }
                return prompt.to_string();
            }
        }
        _ => {}
    }

    tool_name.to_string()
}

/// Shorten a file path for display (show last 2 components with .../prefix).
fn shorten_path(path: &str) -> String {
    let components: Vec<&str> = path.split('/').collect();
    if components.len() > 3 {
        format!(".../{}", components[components.len() - 2..].join("/"))
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athena_protocol::{hook_interaction, DecisionSource, EventContext};

    fn runtime_event(hook_name: &str, request_id: &str, payload: Value) -> RuntimeEvent {
        let tool_name = payload
            .get("tool_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let tool_use_id = payload
            .get("tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        RuntimeEvent {
            id: request_id.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            hook_name: hook_name.to_string(),
            session_id: "adapter-1".to_string(),
            context: EventContext::default(),
            interaction: hook_interaction(hook_name),
            tool_name,
            tool_use_id,
            payload,
        }
    }

    fn seqs(events: &[FeedEvent]) -> Vec<u64> {
        events.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn unknown_hook_yields_exactly_one_event() {
        let mut mapper = FeedMapper::new("sess");
        let events = mapper.map_event(&runtime_event(
            "FutureHookV99",
            "r1",
            serde_json::json!({"some_new_field": "value"}),
        ));

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.title.contains("FutureHookV99"));
        match &event.data {
            FeedData::UnknownHook(data) => {
                assert_eq!(data.hook_event_name, "FutureHookV99");
                assert_eq!(data.payload["some_new_field"], "value");
            }
            other => panic!("expected unknown.hook, got {}", other.kind()),
        }
    }

    #[test]
    fn seq_is_strictly_monotonic_without_gaps() {
        let mut mapper = FeedMapper::new("sess");
        let mut all = Vec::new();
        all.extend(mapper.map_event(&runtime_event(hooks::SESSION_START, "r1", Value::Null)));
        all.extend(mapper.map_event(&runtime_event(
            hooks::USER_PROMPT_SUBMIT,
            "r2",
            serde_json::json!({"prompt": "go"}),
        )));
        all.extend(mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r3",
            serde_json::json!({"tool_name": "Bash", "tool_input": {"command": "ls"}}),
        )));
        all.extend(mapper.map_event(&runtime_event(hooks::SESSION_END, "r4", Value::Null)));

        let seqs = seqs(&all);
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn checkpoint_resume_continues_numbering() {
        let mut mapper = FeedMapper::with_checkpoint(
            "sess",
            MapperCheckpoint {
                max_seq: 41,
                open_run: Some("run-7".to_string()),
                known_subagents: vec![],
            },
        );
        let events = mapper.map_event(&runtime_event(hooks::STOP, "r1", Value::Null));
        assert_eq!(events[0].seq, 42);
        assert_eq!(events[0].run_id.as_deref(), Some("run-7"));
    }

    #[test]
    fn prompt_submit_rolls_the_run() {
        let mut mapper = FeedMapper::new("sess");
        let first = mapper.map_event(&runtime_event(
            hooks::USER_PROMPT_SUBMIT,
            "r1",
            serde_json::json!({"prompt": "first"}),
        ));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].data.kind(), "run.start");
        assert_eq!(first[0].run_id.as_deref(), Some("r1"));
        assert_eq!(first[0].actor_id, actor::USER);

        let second = mapper.map_event(&runtime_event(
            hooks::USER_PROMPT_SUBMIT,
            "r2",
            serde_json::json!({"prompt": "second"}),
        ));
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].data.kind(), "run.end");
        assert_eq!(second[1].data.kind(), "run.start");
        assert_eq!(second[1].run_id.as_deref(), Some("r2"));

        let end = mapper.map_event(&runtime_event(hooks::SESSION_END, "r3", Value::Null));
        assert_eq!(end[0].data.kind(), "run.end");
        assert_eq!(end[1].data.kind(), "session.end");
        assert!(mapper.open_run().is_none());
    }

    #[test]
    fn tool_pre_and_post_share_invocation_id() {
        let mut mapper = FeedMapper::new("sess");
        let pre = mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r1",
            serde_json::json!({"tool_name": "Bash", "tool_use_id": "toolu_01"}),
        ));
        let post = mapper.map_event(&runtime_event(
            hooks::POST_TOOL_USE,
            "r2",
            serde_json::json!({"tool_name": "Bash", "tool_use_id": "toolu_01"}),
        ));

        let (FeedData::ToolStart(start), FeedData::ToolFinish(finish)) =
            (&pre[0].data, &post[0].data)
        else {
            panic!("expected tool.start / tool.finish");
        };
        assert_eq!(start.invocation_id, "toolu_01");
        assert_eq!(finish.invocation_id, "toolu_01");
    }

    #[test]
    fn anonymous_tools_correlate_by_name() {
        let mut mapper = FeedMapper::new("sess");
        let pre = mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r1",
            serde_json::json!({"tool_name": "Bash"}),
        ));
        let failure = mapper.map_event(&runtime_event(
            hooks::POST_TOOL_USE_FAILURE,
            "r2",
            serde_json::json!({"tool_name": "Bash", "error": "exit 1"}),
        ));

        let (FeedData::ToolStart(start), FeedData::ToolError(error)) =
            (&pre[0].data, &failure[0].data)
        else {
            panic!("expected tool.start / tool.error");
        };
        assert_eq!(start.invocation_id, error.invocation_id);
        assert_eq!(failure[0].level, EventLevel::Error);
    }

    #[test]
    fn task_tools_aggregate_instead_of_tool_events() {
        let mut mapper = FeedMapper::new("sess");

        let created = mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r1",
            serde_json::json!({"tool_name": "TaskCreate", "tool_input": {"subject": "write tests"}}),
        ));
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].data.kind(), "todo.update");

        let updated = mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r2",
            serde_json::json!({"tool_name": "TaskUpdate", "tool_input": {"taskId": 1, "status": "in_progress"}}),
        ));
        let FeedData::TodoUpdate(data) = &updated[0].data else {
            panic!("expected todo.update");
        };
        assert_eq!(data.tasks.len(), 1);
        assert_eq!(data.tasks[0].status, "in_progress");

        let deleted = mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r3",
            serde_json::json!({"tool_name": "TaskUpdate", "tool_input": {"taskId": 1, "status": "deleted"}}),
        ));
        let FeedData::TodoUpdate(data) = &deleted[0].data else {
            panic!("expected todo.update");
        };
        assert!(data.tasks.is_empty());
        assert!(mapper.tasks().is_empty());

        // Post hooks of task tools are swallowed entirely.
        let post = mapper.map_event(&runtime_event(
            hooks::POST_TOOL_USE,
            "r4",
            serde_json::json!({"tool_name": "TaskCreate"}),
        ));
        assert!(post.is_empty());
    }

    #[test]
    fn task_ids_are_sequential() {
        let mut mapper = FeedMapper::new("sess");
        for (i, subject) in ["a", "b", "c"].iter().enumerate() {
            mapper.map_event(&runtime_event(
                hooks::PRE_TOOL_USE,
                &format!("r{i}"),
                serde_json::json!({"tool_name": "TaskCreate", "tool_input": {"subject": subject}}),
            ));
        }
        let ids: Vec<u64> = mapper.tasks().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn subagent_scope_changes_actor() {
        let mut mapper = FeedMapper::new("sess");
        mapper.map_event(&runtime_event(
            hooks::SUBAGENT_START,
            "r1",
            serde_json::json!({"agent_id": "agent-9", "agent_type": "researcher"}),
        ));

        let tool = mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r2",
            serde_json::json!({"tool_name": "Read", "tool_use_id": "t1"}),
        ));
        assert_eq!(tool[0].actor_id, actor::subagent("agent-9"));

        let stop = mapper.map_event(&runtime_event(
            hooks::SUBAGENT_STOP,
            "r3",
            serde_json::json!({"agent_id": "agent-9"}),
        ));
        assert_eq!(stop[0].actor_id, actor::AGENT);

        let after = mapper.map_event(&runtime_event(
            hooks::PRE_TOOL_USE,
            "r4",
            serde_json::json!({"tool_name": "Read", "tool_use_id": "t2"}),
        ));
        assert_eq!(after[0].actor_id, actor::AGENT);
    }

    #[test]
    fn decision_events_link_to_their_parent() {
        let mut mapper = FeedMapper::new("sess");
        let request = mapper.map_event(&runtime_event(
            hooks::PERMISSION_REQUEST,
            "r1",
            serde_json::json!({"tool_name": "Edit"}),
        ));

        let decision = RuntimeDecision::json(
            DecisionSource::Rule,
            DecisionIntent::PermissionDeny {
                reason: "denied".to_string(),
            },
        );
        let mapped = mapper
            .map_decision(&request[0], "r1", &decision, 0)
            .unwrap();

        assert_eq!(mapped.data.kind(), "permission.decision");
        let cause = mapped.cause.as_ref().unwrap();
        assert_eq!(
            cause.parent_event_id.as_deref(),
            Some(request[0].event_id.as_str())
        );
        assert_eq!(cause.hook_request_id.as_deref(), Some("r1"));
        assert!(mapped.seq > request[0].seq);
    }

    #[test]
    fn passthrough_decisions_map_to_nothing() {
        let mut mapper = FeedMapper::new("sess");
        let request = mapper.map_event(&runtime_event(hooks::STOP, "r1", Value::Null));
        let decision = RuntimeDecision::passthrough(DecisionSource::Rule);
        assert!(mapper
            .map_decision(&request[0], "r1", &decision, 0)
            .is_none());
    }

    #[test]
    fn tool_titles_summarize_inputs() {
        assert_eq!(
            tool_title(
                "Read",
                Some(&serde_json::json!({"file_path": "/a/b/c/src/main.rs"}))
            ),
            "Read: .../src/main.rs"
        );
        assert_eq!(
            tool_title("Bash", Some(&serde_json::json!({"command": "echo hi"}))),
            "Bash: echo hi"
        );
        assert_eq!(tool_title("Mystery", None), "Mystery");
    }
}
