//! The consume loop and intent dispatcher that turn inbound-bus traffic into
//! pipeline runs and, downstream, channel-adapter side effects.
//!
//! Grounds on `examples/original_source/yeoman/app/bootstrap.py`
//! (`OrchestratorService.run` / `_dispatch_intents`).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use warden_bus::{MessageBus, ReactionDispatch, SharedBus};
use warden_core::{Intent, MemoryNotesPort, OutboundEvent, RuntimeSupervisorPort, TelemetryPort};
use warden_pipeline::{Pipeline, PipelineContext};
use warden_policy::PolicyEngine;

use crate::ports::TypingNotifierPort;

/// Everything the consume loop needs to run one event through the pipeline
/// and dispatch its intents. Built once at startup in `main.rs`.
pub struct OrchestratorService {
    bus: SharedBus,
    pipeline: Pipeline,
    typing: Arc<dyn TypingNotifierPort>,
    telemetry: Arc<dyn TelemetryPort>,
    memory: Arc<dyn MemoryNotesPort>,
    stop: watch::Receiver<bool>,
}

impl OrchestratorService {
    pub fn new(
        bus: SharedBus,
        pipeline: Pipeline,
        typing: Arc<dyn TypingNotifierPort>,
        telemetry: Arc<dyn TelemetryPort>,
        memory: Arc<dyn MemoryNotesPort>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self { bus, pipeline, typing, telemetry, memory, stop }
    }

    /// Consumes inbound events until told to stop. A 1-second poll timeout
    /// keeps shutdown responsive even while the bus is idle.
    pub async fn run(mut self) {
        info!(stages = self.pipeline.len(), "orchestrator consume loop started");
        loop {
            if *self.stop.borrow() {
                break;
            }

            tokio::select! {
                event = tokio::time::timeout(Duration::from_secs(1), self.bus.consume_inbound()) => {
                    let Ok(event) = event else { continue };
                    let channel = event.channel.clone();
                    let chat_id = event.chat_id.clone();

                    let mut ctx = PipelineContext::new(event);
                    self.pipeline.run(&mut ctx).await;
                    self.dispatch_intents(ctx.intents).await;
                    let _ = (channel, chat_id);
                }
                _ = self.stop.changed() => {
                    if *self.stop.borrow() {
                        info!("orchestrator consume loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Exhaustive match over every `Intent` variant — adding a variant to
    /// `warden_core::Intent` must fail this function to compile until it is
    /// handled here, by construction (no wildcard arm).
    async fn dispatch_intents(&self, intents: Vec<Intent>) {
        for intent in intents {
            match intent {
                Intent::SetTyping { channel, chat_id, enabled } => {
                    self.typing.set_typing(&channel, &chat_id, enabled).await;
                }
                Intent::SendOutbound { event } => {
                    self.bus.publish_outbound(event).await;
                }
                Intent::SendReaction { channel, chat_id, message_id, emoji, participant } => {
                    self.bus
                        .publish_reaction(ReactionDispatch { channel, chat_id, message_id, emoji, participant })
                        .await;
                }
                Intent::PersistSession { .. } => {
                    // Session persistence is a responder-port implementation
                    // concern; nothing to do at this layer.
                }
                Intent::QueueMemoryNotesCapture {
                    channel,
                    chat_id,
                    sender_id,
                    message_id,
                    content,
                    is_group,
                    mode,
                    batch_interval_seconds,
                    batch_max_messages,
                } => {
                    if let Err(e) = self
                        .memory
                        .enqueue_background_note(
                            &channel,
                            &chat_id,
                            &sender_id,
                            message_id.as_deref(),
                            &content,
                            is_group,
                            mode,
                            batch_interval_seconds,
                            batch_max_messages,
                        )
                        .await
                    {
                        warn!(error = %e, "memory_notes_enqueue_failed");
                    }
                }
                Intent::RecordManualMemory { channel, chat_id, sender_id, content, kind } => {
                    if let Err(e) = self.memory.record_manual(&channel, &chat_id, &sender_id, &content, kind).await {
                        warn!(error = %e, "manual_memory_record_failed");
                    }
                }
                Intent::RecordMetric { name, value, labels } => {
                    let label_refs: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                    self.telemetry.incr(&name, value, &label_refs);
                }
            }
        }
    }
}

/// Runs one inbound event through `pipeline` outside the consume loop (e.g.
/// a one-off apology reply) and publishes any `SendOutbound` intents it
/// produces directly, bypassing the rest of dispatch. Used by `main.rs`'s
/// top-level error handler when the pipeline run itself fails.
pub async fn publish_apology(bus: &MessageBus, channel: &str, chat_id: &str, err: impl std::fmt::Display) {
    error!(channel, chat_id, %err, "pipeline run failed");
    bus.publish_outbound(OutboundEvent::text(channel, chat_id, format!("Sorry, I encountered an error: {err}")))
        .await;
}

/// Periodically polls `policy_path`'s mtime and hot-swaps a freshly loaded,
/// validated `PolicyEngine` into `current`. Grounds on
/// `nanobot/adapters/policy_engine.py`'s `_maybe_reload`.
pub fn spawn_policy_reload_task(
    current: Arc<ArcSwap<PolicyEngine>>,
    policy_path: PathBuf,
    workspace: PathBuf,
    apply_channels: Vec<String>,
    known_tools: HashSet<String>,
    check_interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime = std::fs::metadata(&policy_path).and_then(|m| m.modified()).ok();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    let mtime = match std::fs::metadata(&policy_path).and_then(|m| m.modified()) {
                        Ok(m) => m,
                        Err(_) => continue,
                    };
                    if last_mtime == Some(mtime) {
                        continue;
                    }

                    match warden_policy::load_policy(&policy_path) {
                        Ok(policy) => {
                            let candidate = PolicyEngine::new(policy, workspace.clone(), Some(apply_channels.clone()));
                            if let Err(e) = candidate.validate(&known_tools) {
                                warn!(error = %e, "policy_reload_validation_failed, keeping previous policy live");
                                continue;
                            }
                            current.store(Arc::new(candidate));
                            last_mtime = Some(mtime);
                            info!("policy reloaded from disk");
                        }
                        Err(e) => warn!(error = %e, "policy_reload_load_failed"),
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Calls `ensure_ready` once at startup and logs the resulting report. A
/// thin pass-through — bridge/runtime implementations are out of scope.
pub async fn check_runtime_ready(supervisor: Option<&Arc<dyn RuntimeSupervisorPort>>, auto_repair: bool, start_if_needed: bool) {
    let Some(supervisor) = supervisor else { return };
    match supervisor.ensure_ready(auto_repair, start_if_needed).await {
        Ok(report) => {
            if report.ready {
                info!(detail = ?report.detail, "runtime supervisor reports ready");
            } else {
                warn!(detail = ?report.detail, "runtime supervisor reports not ready");
            }
        }
        Err(e) => warn!(error = %e, "runtime_supervisor_ensure_ready_failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use warden_core::{ManualMemoryKind, NotesMode, Result};

    struct RecordingTyping(StdMutex<Vec<(String, String, bool)>>);

    #[async_trait]
    impl TypingNotifierPort for RecordingTyping {
        async fn set_typing(&self, channel: &str, chat_id: &str, enabled: bool) {
            self.0.lock().unwrap().push((channel.to_string(), chat_id.to_string(), enabled));
        }
    }

    struct RecordingTelemetry(StdMutex<Vec<String>>);

    impl TelemetryPort for RecordingTelemetry {
        fn incr(&self, name: &str, _value: i64, _labels: &[(&str, &str)]) {
            self.0.lock().unwrap().push(name.to_string());
        }
    }

    struct RecordingMemory(StdMutex<Vec<String>>);

    #[async_trait]
    impl MemoryNotesPort for RecordingMemory {
        async fn enqueue_background_note(
            &self,
            _channel: &str,
            _chat_id: &str,
            _sender_id: &str,
            _message_id: Option<&str>,
            _content: &str,
            _is_group: bool,
            _mode: NotesMode,
            _batch_interval_seconds: u64,
            _batch_max_messages: u32,
        ) -> Result<()> {
            self.0.lock().unwrap().push("enqueue".to_string());
            Ok(())
        }

        async fn record_manual(&self, _channel: &str, _chat_id: &str, _sender_id: &str, _content: &str, _kind: ManualMemoryKind) -> Result<()> {
            self.0.lock().unwrap().push("manual".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_intents_routes_every_variant() {
        let bus: SharedBus = Arc::new(MessageBus::new(8, 8, 8));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let typing = Arc::new(RecordingTyping(StdMutex::new(Vec::new())));
        let telemetry = Arc::new(RecordingTelemetry(StdMutex::new(Vec::new())));
        let memory = Arc::new(RecordingMemory(StdMutex::new(Vec::new())));

        let service = OrchestratorService::new(
            bus.clone(),
            Pipeline::new(Vec::new()),
            typing.clone(),
            telemetry.clone(),
            memory.clone(),
            stop_rx,
        );

        let intents = vec![
            Intent::SetTyping { channel: "whatsapp".to_string(), chat_id: "c1".to_string(), enabled: true },
            Intent::SendOutbound { event: OutboundEvent::text("whatsapp", "c1", "hi") },
            Intent::SendReaction {
                channel: "whatsapp".to_string(),
                chat_id: "c1".to_string(),
                message_id: "m1".to_string(),
                emoji: "\u{1F44D}".to_string(),
                participant: None,
            },
            Intent::PersistSession { session_key: "whatsapp:c1".to_string(), user_content: "hi".to_string(), assistant_content: "yo".to_string() },
            Intent::QueueMemoryNotesCapture {
                channel: "whatsapp".to_string(),
                chat_id: "c1".to_string(),
                sender_id: "s1".to_string(),
                message_id: None,
                content: "hi".to_string(),
                is_group: false,
                mode: NotesMode::Adaptive,
                batch_interval_seconds: 300,
                batch_max_messages: 20,
            },
            Intent::RecordManualMemory {
                channel: "whatsapp".to_string(),
                chat_id: "c1".to_string(),
                sender_id: "s1".to_string(),
                content: "idea".to_string(),
                kind: ManualMemoryKind::Idea,
            },
            Intent::RecordMetric { name: "test_metric".to_string(), value: 1, labels: Vec::new() },
        ];

        service.dispatch_intents(intents).await;

        assert_eq!(typing.0.lock().unwrap().len(), 1);
        assert_eq!(telemetry.0.lock().unwrap().as_slice(), ["test_metric"]);
        assert_eq!(memory.0.lock().unwrap().len(), 2);
        assert_eq!(bus.status().await.outbound_len, 1);
        assert_eq!(bus.status().await.reaction_len, 1);
    }
}
