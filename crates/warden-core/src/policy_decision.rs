use serde::{Deserialize, Serialize};

use crate::types::{NotesMode, VoiceOutputMode, WhenToReplyMode};

/// Outcome of evaluating an `InboundEvent` against the compiled policy for its
/// chat. Carries enough detail for downstream middleware to act without
/// re-consulting the policy engine, and enough for diagnostics (`explain-group`)
/// to report which layer decided what.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub accept_message: bool,
    pub should_respond: bool,
    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,

    #[serde(default)]
    pub persona_file: Option<String>,

    /// The compiled `when_to_reply` mode for this chat, carried through so the
    /// outbound-assembly stage can decide mention-only threading without
    /// re-consulting the policy engine.
    #[serde(default = "WhenToReplyMode::default_mode")]
    pub when_to_reply_mode: WhenToReplyMode,

    #[serde(default)]
    pub voice_output_mode: VoiceOutputMode,
    #[serde(default = "default_tts_route")]
    pub voice_tts_route: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default = "default_voice_format")]
    pub voice_format: String,
    #[serde(default = "default_max_sentences")]
    pub voice_max_sentences: u32,
    #[serde(default = "default_max_chars")]
    pub voice_max_chars: u32,

    #[serde(default)]
    pub notes_enabled: bool,
    #[serde(default)]
    pub notes_mode: Option<NotesMode>,
    #[serde(default)]
    pub notes_allow_blocked_senders: bool,
    #[serde(default = "default_batch_interval")]
    pub notes_batch_interval_seconds: u64,
    #[serde(default = "default_batch_max")]
    pub notes_batch_max_messages: u32,

    #[serde(default)]
    pub is_owner: bool,

    /// `"default"`, `"channel"`, or `"chat"` — which policy layer produced the
    /// effective `when_to_reply`/`who_can_talk` settings for this chat, used
    /// by the admin `status-group`/`explain-group` commands.
    #[serde(default)]
    pub source_layer: Option<String>,
}

fn default_batch_interval() -> u64 {
    300
}
fn default_batch_max() -> u32 {
    20
}
fn default_tts_route() -> String {
    "default".to_string()
}
fn default_voice_format() -> String {
    "opus".to_string()
}
fn default_max_sentences() -> u32 {
    6
}
fn default_max_chars() -> u32 {
    600
}

impl PolicyDecision {
    /// Decision used for channels the policy engine is not applied to
    /// (`apply_channels` exclusion) or when policy evaluation itself errors
    /// under a fail-open configuration.
    pub fn allow_all(reason: impl Into<String>) -> Self {
        Self {
            accept_message: true,
            should_respond: true,
            reason: Some(reason.into()),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            persona_file: None,
            when_to_reply_mode: WhenToReplyMode::All,
            voice_output_mode: VoiceOutputMode::Text,
            voice_tts_route: default_tts_route(),
            voice: String::new(),
            voice_format: default_voice_format(),
            voice_max_sentences: default_max_sentences(),
            voice_max_chars: default_max_chars(),
            notes_enabled: false,
            notes_mode: None,
            notes_allow_blocked_senders: false,
            notes_batch_interval_seconds: default_batch_interval(),
            notes_batch_max_messages: default_batch_max(),
            is_owner: false,
            source_layer: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            accept_message: false,
            should_respond: false,
            reason: Some(reason.into()),
            ..Self::allow_all("blocked")
        }
    }
}
