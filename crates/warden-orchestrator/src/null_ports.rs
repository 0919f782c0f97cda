//! Inert fallbacks for ports whose concrete backend is outside this crate's
//! scope (LLM responder, TTS, memory store). These let the orchestrator run
//! end-to-end without a channel adapter wired in — useful for the `/status`
//! smoke path and for tests — while logging loudly that nothing real happened.

use async_trait::async_trait;
use tracing::{debug, warn};
use warden_core::{
    InboundEvent, LlmRisk, ManualMemoryKind, MemoryNotesPort, NotesMode, PolicyDecision, Result, ResponderPort, TelemetryPort,
};

pub struct NullTelemetry;

impl TelemetryPort for NullTelemetry {
    fn incr(&self, name: &str, value: i64, labels: &[(&str, &str)]) {
        debug!(metric = name, value, ?labels, "metric");
    }
}

pub struct NullMemoryNotes;

#[async_trait]
impl MemoryNotesPort for NullMemoryNotes {
    async fn enqueue_background_note(
        &self,
        channel: &str,
        chat_id: &str,
        _sender_id: &str,
        _message_id: Option<&str>,
        _content: &str,
        _is_group: bool,
        _mode: NotesMode,
        _batch_interval_seconds: u64,
        _batch_max_messages: u32,
    ) -> Result<()> {
        warn!(channel, chat_id, "memory notes capture has no backend wired in, dropping");
        Ok(())
    }

    async fn record_manual(&self, channel: &str, chat_id: &str, _sender_id: &str, _content: &str, kind: ManualMemoryKind) -> Result<()> {
        warn!(channel, chat_id, ?kind, "manual memory capture has no backend wired in, dropping");
        Ok(())
    }
}

/// Echoes a canned reply. Only useful for smoke-testing the pipeline
/// wiring; a real deployment replaces this with an LLM-backed responder.
pub struct EchoResponder;

#[async_trait]
impl ResponderPort for EchoResponder {
    async fn generate_reply(&self, event: &InboundEvent, _decision: &PolicyDecision) -> Result<Option<String>> {
        Ok(Some(format!("echo: {}", event.content)))
    }
}

pub struct AlwaysLowRiskClassifier;

#[async_trait]
impl warden_core::LlmClassifierPort for AlwaysLowRiskClassifier {
    async fn classify(&self, _text: &str) -> Result<LlmRisk> {
        Ok(LlmRisk::Low)
    }
}
