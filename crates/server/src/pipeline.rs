//! Session pipeline: one actor task owning engine, mapper, store, and bus.
//!
//! The transport feeds runtime events into this task's queue; everything
//! downstream (decisions, mapping, persistence, fan-out) runs here in
//! strict receipt order, which is what makes seq allocation race-free
//! without locks. External callers hold a clone-cheap [`PipelineHandle`].

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use athena_protocol::{
    hooks, FeedEvent, HookRule, RuntimeDecision, RuntimeEvent, TaskItem, TranscriptSummary,
};

use crate::bus::{EventBus, SubscriptionId};
use crate::engine::{DecisionEngine, EngineEffect};
use crate::mapper::FeedMapper;
use crate::store::SessionStore;
use crate::transcript::parse_transcript;
use crate::transport::DecisionRouter;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// A queued request as shown to dialog collaborators.
#[derive(Debug, Clone)]
pub struct PendingView {
    pub request_id: String,
    pub tool_name: String,
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct PendingSnapshot {
    pub permissions: Vec<PendingView>,
    pub questions: Vec<PendingView>,
}

/// Commands processed by the pipeline actor.
pub enum PipelineCommand {
    /// User verdict for a queued permission request.
    ResolvePermission {
        request_id: String,
        allow: bool,
        reason: Option<String>,
    },
    /// User answers for a queued question dialog.
    AnswerQuestion {
        request_id: String,
        answers: HashMap<String, String>,
    },
    AddRule(HookRule),
    RemoveRule {
        rule_id: String,
    },
    ClearRules,
    /// Bulk cleanup when a dialog client disconnects; abandoned requests
    /// resolve to the default passthrough rather than stranding.
    ClearPending,
    /// Async transcript parse finished.
    TranscriptParsed {
        parent_event_id: String,
        epoch: u64,
        transcript_path: String,
        summary: TranscriptSummary,
    },
    Subscribe {
        reply: oneshot::Sender<(SubscriptionId, mpsc::Receiver<FeedEvent>)>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    GetPending {
        reply: oneshot::Sender<PendingSnapshot>,
    },
    Shutdown,
}

/// Handle to a running pipeline (cheap to Clone).
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<PipelineCommand>,
    tasks: Arc<ArcSwap<Vec<TaskItem>>>,
}

impl PipelineHandle {
    async fn send(&self, command: PipelineCommand) {
        if self.commands.send(command).await.is_err() {
            warn!(
                component = "pipeline",
                event = "pipeline.channel_closed",
                "Pipeline gone, command dropped"
            );
        }
    }

    pub async fn resolve_permission(&self, request_id: &str, allow: bool, reason: Option<String>) {
        self.send(PipelineCommand::ResolvePermission {
            request_id: request_id.to_string(),
            allow,
            reason,
        })
        .await;
    }

    pub async fn answer_question(&self, request_id: &str, answers: HashMap<String, String>) {
        self.send(PipelineCommand::AnswerQuestion {
            request_id: request_id.to_string(),
            answers,
        })
        .await;
    }

    pub async fn add_rule(&self, rule: HookRule) {
        self.send(PipelineCommand::AddRule(rule)).await;
    }

    pub async fn remove_rule(&self, rule_id: &str) {
        self.send(PipelineCommand::RemoveRule {
            rule_id: rule_id.to_string(),
        })
        .await;
    }

    pub async fn clear_rules(&self) {
        self.send(PipelineCommand::ClearRules).await;
    }

    pub async fn clear_pending(&self) {
        self.send(PipelineCommand::ClearPending).await;
    }

    /// Attach a feed subscriber; `None` if the pipeline already shut down.
    pub async fn subscribe(&self) -> Option<(SubscriptionId, mpsc::Receiver<FeedEvent>)> {
        let (tx, rx) = oneshot::channel();
        self.send(PipelineCommand::Subscribe { reply: tx }).await;
        rx.await.ok()
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.send(PipelineCommand::Unsubscribe { id }).await;
    }

    pub async fn pending(&self) -> PendingSnapshot {
        let (tx, rx) = oneshot::channel();
        self.send(PipelineCommand::GetPending { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    /// Lock-free read of the aggregated task list.
    pub fn tasks(&self) -> Vec<TaskItem> {
        self.tasks.load().as_ref().clone()
    }

    pub async fn shutdown(&self) {
        self.send(PipelineCommand::Shutdown).await;
    }
}

/// The actor. Owns every mutable pipeline component.
pub struct Pipeline {
    engine: DecisionEngine,
    mapper: FeedMapper,
    store: SessionStore,
    bus: EventBus,
    router: DecisionRouter,
    events_rx: mpsc::Receiver<RuntimeEvent>,
    commands_rx: mpsc::Receiver<PipelineCommand>,
    self_tx: mpsc::Sender<PipelineCommand>,
    /// request id → the feed event a later decision event must link to.
    pending_parents: HashMap<String, FeedEvent>,
    /// Session-context epoch; bumping it invalidates in-flight parses.
    epoch: u64,
    cancel_tx: watch::Sender<bool>,
}

impl Pipeline {
    /// Spawn the pipeline task. Returns the handle and the sender the
    /// transport feeds runtime events into.
    pub fn spawn(
        engine: DecisionEngine,
        mapper: FeedMapper,
        store: SessionStore,
        router: DecisionRouter,
    ) -> (PipelineHandle, mpsc::Sender<RuntimeEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, _) = watch::channel(false);
        let tasks = mapper.task_snapshot_handle();

        let pipeline = Pipeline {
            engine,
            mapper,
            store,
            bus: EventBus::new(),
            router,
            events_rx,
            commands_rx,
            self_tx: commands_tx.clone(),
            pending_parents: HashMap::new(),
            epoch: 0,
            cancel_tx,
        };
        tokio::spawn(pipeline.run());

        (
            PipelineHandle {
                commands: commands_tx,
                tasks,
            },
            events_tx,
        )
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.handle_hook_event(event).await;
                }
                Some(command) = self.commands_rx.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                else => break,
            }
        }

        // Teardown: abort in-flight parses and drop parked connections so
        // remote clients fall back to their own timeouts.
        let _ = self.cancel_tx.send(true);
        self.router.abandon_all();
        debug!(
            component = "pipeline",
            event = "pipeline.stopped",
            "Pipeline stopped"
        );
    }

    async fn handle_hook_event(&mut self, event: RuntimeEvent) {
        if event.hook_name == hooks::SESSION_START {
            // A new harness session replaces the old context; parses still
            // in flight for the previous one must not land on it.
            self.bump_epoch();
        }

        let outcome = self.engine.evaluate(&event);
        let feed = self.mapper.map_event(&event);

        if let Err(err) = self.store.record_event(&event, &feed).await {
            // Durability failure is loud, but the remote hook client still
            // gets its decision.
            error!(
                component = "pipeline",
                event = "pipeline.persist_failed",
                request_id = %event.id,
                hook_name = %event.hook_name,
                error = %err,
                "Failed to persist hook event"
            );
        }
        for feed_event in &feed {
            self.bus.publish(feed_event);
        }

        for effect in &outcome.effects {
            match effect {
                EngineEffect::ParseTranscript { path } => {
                    if let Some(parent) = find_kind(&feed, "session.end") {
                        self.spawn_parse(path.clone(), parent.event_id.clone());
                    }
                }
                EngineEffect::WriteDocument(write) => {
                    let path = write.path.clone();
                    let contents = write.contents.clone();
                    tokio::spawn(async move {
                        if let Err(err) = tokio::fs::write(&path, contents).await {
                            warn!(
                                component = "pipeline",
                                event = "pipeline.loop_doc_write_failed",
                                path = %path.display(),
                                error = %err,
                                "Failed to write loop progress document"
                            );
                        }
                    });
                }
                EngineEffect::LoopEnded { reason, iteration } => {
                    if let Some(parent) = find_kind(&feed, "stop.request") {
                        let released =
                            self.mapper
                                .stop_released(parent, *iteration, reason.describe());
                        self.record_and_publish(released).await;
                    }
                }
            }
        }

        if let Some(decision) = outcome.decision {
            let parent = decision_parent(&feed).cloned();
            self.finish_decision(parent.as_ref(), &event.id, decision)
                .await;
        } else if outcome.queued.is_some() {
            // Connection stays parked; remember the parent for the
            // eventual `*.decision` event.
            if let Some(parent) = decision_parent(&feed) {
                self.pending_parents
                    .insert(event.id.clone(), parent.clone());
            }
        } else {
            self.router.release(&event.id);
        }
    }

    /// Returns false when the pipeline should stop.
    async fn handle_command(&mut self, command: PipelineCommand) -> bool {
        match command {
            PipelineCommand::ResolvePermission {
                request_id,
                allow,
                reason,
            } => {
                match self.engine.resolve_permission(&request_id, allow, reason) {
                    Some(decision) => {
                        let parent = self.pending_parents.remove(&request_id);
                        self.finish_decision(parent.as_ref(), &request_id, decision)
                            .await;
                    }
                    None => {
                        warn!(
                            component = "pipeline",
                            event = "pipeline.unknown_permission_request",
                            request_id = %request_id,
                            "Permission resolution for unknown request"
                        );
                    }
                }
            }

            PipelineCommand::AnswerQuestion {
                request_id,
                answers,
            } => match self.engine.answer_question(&request_id, answers) {
                Some(decision) => {
                    let parent = self.pending_parents.remove(&request_id);
                    self.finish_decision(parent.as_ref(), &request_id, decision)
                        .await;
                }
                None => {
                    warn!(
                        component = "pipeline",
                        event = "pipeline.unknown_question_request",
                        request_id = %request_id,
                        "Answer for unknown question request"
                    );
                }
            },

            PipelineCommand::AddRule(rule) => self.engine.add_rule(rule),
            PipelineCommand::RemoveRule { rule_id } => {
                self.engine.remove_rule(&rule_id);
            }
            PipelineCommand::ClearRules => self.engine.clear_rules(),

            PipelineCommand::ClearPending => {
                for request_id in self.engine.clear_pending() {
                    self.pending_parents.remove(&request_id);
                    self.router.release(&request_id);
                }
            }

            PipelineCommand::TranscriptParsed {
                parent_event_id,
                epoch,
                transcript_path,
                summary,
            } => {
                self.apply_transcript(parent_event_id, epoch, transcript_path, summary)
                    .await;
            }

            PipelineCommand::Subscribe { reply } => {
                let _ = reply.send(self.bus.subscribe());
            }
            PipelineCommand::Unsubscribe { id } => self.bus.unsubscribe(id),

            PipelineCommand::GetPending { reply } => {
                let snapshot = PendingSnapshot {
                    permissions: self
                        .engine
                        .pending_permissions()
                        .map(|p| PendingView {
                            request_id: p.request_id.clone(),
                            tool_name: p.tool_name.clone(),
                            input: p.input.clone(),
                        })
                        .collect(),
                    questions: self
                        .engine
                        .pending_questions()
                        .map(|p| PendingView {
                            request_id: p.request_id.clone(),
                            tool_name: p.tool_name.clone(),
                            input: p.input.clone(),
                        })
                        .collect(),
                };
                let _ = reply.send(snapshot);
            }

            PipelineCommand::Shutdown => return false,
        }
        true
    }

    /// Map, persist, publish, and route one resolved decision.
    async fn finish_decision(
        &mut self,
        parent: Option<&FeedEvent>,
        request_id: &str,
        decision: RuntimeDecision,
    ) {
        if let Some(parent) = parent {
            if let Some(mapped) = self.mapper.map_decision(
                parent,
                request_id,
                &decision,
                self.engine.loop_iteration(),
            ) {
                self.record_and_publish(mapped).await;
            }
        }
        self.router.send_decision(request_id, decision);
    }

    async fn record_and_publish(&mut self, event: FeedEvent) {
        if let Err(err) = self.store.record_feed_events(std::slice::from_ref(&event)).await {
            error!(
                component = "pipeline",
                event = "pipeline.persist_failed",
                seq = event.seq,
                error = %err,
                "Failed to persist feed event"
            );
        }
        self.bus.publish(&event);
    }

    fn spawn_parse(&self, path: String, parent_event_id: String) {
        let cancel_rx = self.cancel_tx.subscribe();
        let epoch = self.epoch;
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let summary = parse_transcript(std::path::Path::new(&path), cancel_rx).await;
            let _ = self_tx
                .send(PipelineCommand::TranscriptParsed {
                    parent_event_id,
                    epoch,
                    transcript_path: path,
                    summary,
                })
                .await;
        });
    }

    async fn apply_transcript(
        &mut self,
        parent_event_id: String,
        epoch: u64,
        transcript_path: String,
        summary: TranscriptSummary,
    ) {
        // A parse that lost the race with session teardown must not patch
        // newer state.
        if epoch != self.epoch || summary.error.as_deref() == Some("Aborted") {
            debug!(
                component = "pipeline",
                event = "pipeline.stale_parse_discarded",
                parent_event_id = %parent_event_id,
                "Discarding stale transcript parse"
            );
            return;
        }

        if let Err(err) = self.store.attach_summary(&parent_event_id, &summary).await {
            error!(
                component = "pipeline",
                event = "pipeline.summary_patch_failed",
                parent_event_id = %parent_event_id,
                error = %err,
                "Failed to attach transcript summary"
            );
        }

        if let Some(message) =
            self.mapper
                .agent_message(&parent_event_id, Some(transcript_path), &summary)
        {
            self.record_and_publish(message).await;
        }
    }

    fn bump_epoch(&mut self) {
        self.epoch += 1;
        let _ = self.cancel_tx.send(true);
        // Fresh channel for parses started in the new context.
        self.cancel_tx = watch::channel(false).0;
    }
}

/// The feed event a decision of this batch should link to.
fn decision_parent(feed: &[FeedEvent]) -> Option<&FeedEvent> {
    feed.iter().rev().find(|event| {
        matches!(
            event.data.kind(),
            "permission.request" | "stop.request" | "tool.start"
        )
    })
}

fn find_kind<'a>(feed: &'a [FeedEvent], kind: &str) -> Option<&'a FeedEvent> {
    feed.iter().find(|event| event.data.kind() == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_state::{LoopConfig, LoopRunner};
    use athena_protocol::{
        hook_interaction, DecisionAction, DecisionIntent, EventContext, RuleAction,
    };
    use serde_json::Value;

    fn runtime_event(hook_name: &str, request_id: &str, payload: Value) -> RuntimeEvent {
        let tool_name = payload
            .get("tool_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let transcript_path = payload
            .get("transcript_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        RuntimeEvent {
            id: request_id.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            hook_name: hook_name.to_string(),
            session_id: "adapter-1".to_string(),
            context: EventContext {
                cwd: None,
                transcript_path,
            },
            interaction: hook_interaction(hook_name),
            tool_name,
            tool_use_id: None,
            payload,
        }
    }

    struct Harness {
        handle: PipelineHandle,
        events_tx: mpsc::Sender<RuntimeEvent>,
        router: DecisionRouter,
        _dir: tempfile::TempDir,
    }

    async fn harness(rules: Vec<HookRule>, loop_runner: Option<LoopRunner>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("session.db"), "sess-1", "/p")
            .await
            .unwrap();
        let router = DecisionRouter::new();
        let (handle, events_tx) = Pipeline::spawn(
            DecisionEngine::new(rules, loop_runner),
            FeedMapper::new("sess-1"),
            store,
            router.clone(),
        );
        Harness {
            handle,
            events_tx,
            router,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn unqueued_events_release_as_passthrough() {
        let h = harness(vec![], None).await;

        // Register like the transport does, then feed the event.
        let reply_rx = h.router.register("r1");
        h.events_tx
            .send(runtime_event(hooks::NOTIFICATION, "r1", Value::Null))
            .await
            .unwrap();

        let reply = reply_rx.await.unwrap();
        assert!(matches!(reply, crate::transport::RouterReply::Passthrough));
    }

    #[tokio::test]
    async fn rule_denied_permission_resolves_immediately() {
        let h = harness(
            vec![HookRule::new("Edit", RuleAction::Deny, "test")],
            None,
        )
        .await;

        let reply_rx = h.router.register("r1");
        h.events_tx
            .send(runtime_event(
                hooks::PERMISSION_REQUEST,
                "r1",
                serde_json::json!({"tool_name": "Edit"}),
            ))
            .await
            .unwrap();

        let reply = reply_rx.await.unwrap();
        let crate::transport::RouterReply::Decision(decision) = reply else {
            panic!("expected a decision");
        };
        assert!(matches!(
            decision.action,
            DecisionAction::Json {
                intent: DecisionIntent::PermissionDeny { .. }
            }
        ));
    }

    #[tokio::test]
    async fn queued_permission_waits_for_user() {
        let h = harness(vec![], None).await;

        let reply_rx = h.router.register("r1");
        h.events_tx
            .send(runtime_event(
                hooks::PERMISSION_REQUEST,
                "r1",
                serde_json::json!({"tool_name": "Bash"}),
            ))
            .await
            .unwrap();

        // Give the actor a beat, then confirm it queued rather than decided.
        tokio::task::yield_now().await;
        let pending = h.handle.pending().await;
        assert_eq!(pending.permissions.len(), 1);
        assert_eq!(pending.permissions[0].tool_name, "Bash");

        h.handle.resolve_permission("r1", true, None).await;
        let reply = reply_rx.await.unwrap();
        let crate::transport::RouterReply::Decision(decision) = reply else {
            panic!("expected a decision");
        };
        assert!(matches!(
            decision.action,
            DecisionAction::Json {
                intent: DecisionIntent::PermissionAllow
            }
        ));
    }

    #[tokio::test]
    async fn cleared_pending_requests_release_passthrough() {
        let h = harness(vec![], None).await;

        let reply_rx = h.router.register("r1");
        h.events_tx
            .send(runtime_event(
                hooks::PERMISSION_REQUEST,
                "r1",
                serde_json::json!({"tool_name": "Bash"}),
            ))
            .await
            .unwrap();
        tokio::task::yield_now().await;

        h.handle.clear_pending().await;
        let reply = reply_rx.await.unwrap();
        assert!(matches!(reply, crate::transport::RouterReply::Passthrough));
    }

    #[tokio::test]
    async fn loop_blocks_stop_and_emits_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LoopRunner::new(LoopConfig {
            progress_path: dir.path().join("progress.md"),
            continue_message: "carry on".to_string(),
            max_iterations: 1,
            completion_marker: "DONE".to_string(),
        });
        let h = harness(vec![], Some(runner)).await;
        let (sub, mut feed_rx) = h.handle.subscribe().await.unwrap();

        let reply_rx = h.router.register("r1");
        h.events_tx
            .send(runtime_event(hooks::STOP, "r1", Value::Null))
            .await
            .unwrap();
        let reply = reply_rx.await.unwrap();
        assert!(matches!(
            reply,
            crate::transport::RouterReply::Decision(RuntimeDecision {
                action: DecisionAction::Json {
                    intent: DecisionIntent::StopBlock { .. }
                },
                ..
            })
        ));

        // stop.request then stop.decision on the feed.
        assert_eq!(feed_rx.recv().await.unwrap().data.kind(), "stop.request");
        assert_eq!(feed_rx.recv().await.unwrap().data.kind(), "stop.decision");

        // Second Stop: limit reached, released with a terminal decision event.
        let reply_rx = h.router.register("r2");
        h.events_tx
            .send(runtime_event(hooks::STOP, "r2", Value::Null))
            .await
            .unwrap();
        let reply = reply_rx.await.unwrap();
        assert!(matches!(reply, crate::transport::RouterReply::Passthrough));
        assert_eq!(feed_rx.recv().await.unwrap().data.kind(), "stop.request");
        let released = feed_rx.recv().await.unwrap();
        assert_eq!(released.data.kind(), "stop.decision");

        h.handle.unsubscribe(sub).await;
    }

    #[tokio::test]
    async fn session_end_triggers_parse_and_agent_message() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("transcript.jsonl");
        std::fs::write(
            &transcript,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"all done"}]},"timestamp":"2026-01-01T00:02:00Z"}"#,
        )
        .unwrap();

        let h = harness(vec![], None).await;
        let (_sub, mut feed_rx) = h.handle.subscribe().await.unwrap();

        let reply_rx = h.router.register("r1");
        h.events_tx
            .send(runtime_event(
                hooks::SESSION_END,
                "r1",
                serde_json::json!({"transcript_path": transcript.to_str().unwrap()}),
            ))
            .await
            .unwrap();
        reply_rx.await.unwrap();

        assert_eq!(feed_rx.recv().await.unwrap().data.kind(), "session.end");
        let message = feed_rx.recv().await.unwrap();
        assert_eq!(message.data.kind(), "agent.message");
        assert_eq!(message.body.as_deref(), Some("all done"));
    }
}
