use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::event::InboundEvent;
use crate::intent::ManualMemoryKind;
use crate::policy_decision::PolicyDecision;
use crate::security::SecurityResult;
use crate::types::NotesMode;

/// Generates the assistant reply for an accepted, policy-cleared event.
/// Implemented by the agent/LLM layer; the pipeline only depends on this
/// trait, never on a concrete model client.
#[async_trait]
pub trait ResponderPort: Send + Sync {
    async fn generate_reply(
        &self,
        event: &InboundEvent,
        decision: &PolicyDecision,
    ) -> Result<Option<String>>;
}

/// Metrics sink. `incr` is fire-and-forget: a telemetry backend being down
/// must never fail a pipeline run.
pub trait TelemetryPort: Send + Sync {
    fn incr(&self, name: &str, value: i64, labels: &[(&str, &str)]);
}

/// Readiness/self-repair contract for channel runtimes the orchestrator
/// depends on (e.g. a WhatsApp bridge process) but does not itself own.
#[derive(Debug, Clone)]
pub struct ReadyReport {
    pub ready: bool,
    pub detail: Option<String>,
}

#[async_trait]
pub trait RuntimeSupervisorPort: Send + Sync {
    async fn ensure_ready(&self, auto_repair: bool, start_if_needed: bool) -> Result<ReadyReport>;
}

/// Resolves chat-group metadata (alias, tag, bridge subject) for the admin
/// service's `resolve-group`/`list-groups` commands. A channel runtime that
/// cannot answer this (e.g. no bridge attached) returns `None` rather than
/// the admin service reaching out to the runtime itself.
#[async_trait]
pub trait GroupDirectoryPort: Send + Sync {
    async fn subject_for(&self, chat_id: &str) -> Option<String>;
}

/// The three security checkpoints, implemented by `warden-security`.
/// Defined here so `warden-pipeline` middleware can depend on the trait
/// without depending on the concrete engine.
pub trait SecurityPort: Send + Sync {
    fn check_input(&self, event_text: &str, context: &BTreeMap<String, Value>) -> SecurityResult;

    fn check_tool(
        &self,
        tool_name: &str,
        args: &BTreeMap<String, Value>,
        context: &BTreeMap<String, Value>,
    ) -> SecurityResult;

    fn check_output(&self, text: &str, context: &BTreeMap<String, Value>) -> SecurityResult;
}

/// Risk band returned by the optional second-layer LLM input classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRisk {
    Low,
    Medium,
    High,
}

/// Optional async second layer over the regex input stage. Invoked only when
/// the regex stage already allows the text; a `high` verdict blocks, `medium`
/// warns. Transport/parse errors fail open (the caller treats `Err` as `Low`).
#[async_trait]
pub trait LlmClassifierPort: Send + Sync {
    async fn classify(&self, text: &str) -> Result<LlmRisk>;
}

/// Publishes a synthetic inbound event onto the message bus's inbound queue.
/// Implemented by `warden-bus`; used by the cron and heartbeat producers so
/// neither depends on the concrete queue implementation. Fire-and-forget,
/// same as `TelemetryPort`: a full queue drops the oldest entry rather than
/// failing the caller.
#[async_trait]
pub trait InboundPublisherPort: Send + Sync {
    async fn publish_inbound(&self, event: InboundEvent);
}

/// Dispatch target for the two memory-related intents. The core knows
/// nothing about how notes or manual captures are stored; it only needs
/// somewhere to hand the intent off to, per the memory-storage non-goal.
#[async_trait]
pub trait MemoryNotesPort: Send + Sync {
    async fn enqueue_background_note(
        &self,
        channel: &str,
        chat_id: &str,
        sender_id: &str,
        message_id: Option<&str>,
        content: &str,
        is_group: bool,
        mode: NotesMode,
        batch_interval_seconds: u64,
        batch_max_messages: u32,
    ) -> Result<()>;

    async fn record_manual(
        &self,
        channel: &str,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        kind: ManualMemoryKind,
    ) -> Result<()>;
}

/// A single synthesized voice reply: raw audio bytes plus the media kind
/// the channel adapter should tag the outbound attachment with.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub bytes: Vec<u8>,
    pub format: String,
}

/// Text-to-speech synthesis, consumed only by outbound voice-reply assembly.
/// Concrete backends (ElevenLabs, OpenAI-compatible, local) live outside the
/// core per the TTS-backend non-goal.
#[async_trait]
pub trait TtsPort: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Option<&str>, format: &str) -> Result<TtsAudio>;
}

/// A resolved model/route profile: concrete model name and/or TTS route,
/// looked up by a logical route key (e.g. `"assistant.reply"`, `"tts.speak"`).
#[derive(Debug, Clone, Default)]
pub struct RouteProfile {
    pub model: Option<String>,
    pub tts_route: Option<String>,
}

/// Maps logical route keys to concrete provider profiles, optionally
/// preferring a channel-scoped key before falling back to the generic one.
pub trait ModelRouterPort: Send + Sync {
    fn resolve(&self, route_key: &str) -> Option<RouteProfile>;
}
