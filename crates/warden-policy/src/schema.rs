//! Serde shape for the hot-reloadable policy document (`policy.json`).
//!
//! Mirrors the three-level override structure: `defaults` -> per-channel
//! `default` -> per-chat override, deep-merged by [`crate::engine`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use warden_core::{AllowedToolsMode, NotesMode, ToolAccessMode, VoiceOutputMode, WhenToReplyMode, WhoCanTalkMode};

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhoCanTalkPolicy {
    #[serde(default = "WhoCanTalkMode::default_mode")]
    pub mode: WhoCanTalkMode,
    #[serde(default)]
    pub senders: Vec<String>,
}

impl Default for WhoCanTalkPolicy {
    fn default() -> Self {
        Self {
            mode: WhoCanTalkMode::Everyone,
            senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhoCanTalkPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WhoCanTalkMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenToReplyPolicy {
    #[serde(default = "WhenToReplyMode::default_mode")]
    pub mode: WhenToReplyMode,
    #[serde(default)]
    pub senders: Vec<String>,
}

impl Default for WhenToReplyPolicy {
    fn default() -> Self {
        Self {
            mode: WhenToReplyMode::All,
            senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenToReplyPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WhenToReplyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowedToolsPolicy {
    #[serde(default = "AllowedToolsMode::default_mode")]
    pub mode: AllowedToolsMode,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for AllowedToolsPolicy {
    fn default() -> Self {
        Self {
            mode: AllowedToolsMode::All,
            tools: Vec::new(),
            deny: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowedToolsPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AllowedToolsMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockedSendersPolicy {
    #[serde(default)]
    pub senders: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockedSendersPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolAccessRule {
    #[serde(default = "ToolAccessMode::default_mode")]
    pub mode: ToolAccessMode,
    #[serde(default)]
    pub senders: Vec<String>,
}

impl Default for ToolAccessRule {
    fn default() -> Self {
        Self {
            mode: ToolAccessMode::Everyone,
            senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolAccessRuleOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ToolAccessMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceInputPolicy {
    #[serde(default)]
    pub wake_phrases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceInputPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_phrases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceOutputPolicy {
    #[serde(default = "VoiceOutputMode::default_mode")]
    pub mode: VoiceOutputMode,
    #[serde(default = "default_tts_route")]
    pub tts_route: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default = "default_voice_format")]
    pub format: String,
    #[serde(default = "default_max_sentences")]
    pub max_sentences: u32,
    #[serde(default = "default_max_chars")]
    pub max_chars: u32,
}

impl Default for VoiceOutputPolicy {
    fn default() -> Self {
        Self {
            mode: VoiceOutputMode::Text,
            tts_route: default_tts_route(),
            voice: String::new(),
            format: default_voice_format(),
            max_sentences: default_max_sentences(),
            max_chars: default_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceOutputPolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<VoiceOutputMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sentences: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoicePolicy {
    #[serde(default)]
    pub input: VoiceInputPolicy,
    #[serde(default)]
    pub output: VoiceOutputPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoicePolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<VoiceInputPolicyOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<VoiceOutputPolicyOverride>,
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

/// Fully resolved chat policy: every field present, no optionals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatPolicy {
    #[serde(default, rename = "whoCanTalk")]
    pub who_can_talk: WhoCanTalkPolicy,
    #[serde(default, rename = "whenToReply")]
    pub when_to_reply: WhenToReplyPolicy,
    #[serde(default, rename = "blockedSenders")]
    pub blocked_senders: BlockedSendersPolicy,
    #[serde(default, rename = "allowedTools")]
    pub allowed_tools: AllowedToolsPolicy,
    #[serde(default, rename = "toolAccess")]
    pub tool_access: BTreeMap<String, ToolAccessRule>,
    #[serde(default, rename = "personaFile", skip_serializing_if = "Option::is_none")]
    pub persona_file: Option<String>,
    #[serde(default)]
    pub voice: VoicePolicy,
}

/// Partial override applied at channel-default or chat-specific level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatPolicyOverride {
    #[serde(default, rename = "whoCanTalk", skip_serializing_if = "Option::is_none")]
    pub who_can_talk: Option<WhoCanTalkPolicyOverride>,
    #[serde(default, rename = "whenToReply", skip_serializing_if = "Option::is_none")]
    pub when_to_reply: Option<WhenToReplyPolicyOverride>,
    #[serde(default, rename = "blockedSenders", skip_serializing_if = "Option::is_none")]
    pub blocked_senders: Option<BlockedSendersPolicyOverride>,
    #[serde(default, rename = "allowedTools", skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<AllowedToolsPolicyOverride>,
    #[serde(default, rename = "toolAccess", skip_serializing_if = "Option::is_none")]
    pub tool_access: Option<BTreeMap<String, ToolAccessRuleOverride>>,
    #[serde(default, rename = "personaFile", skip_serializing_if = "Option::is_none")]
    pub persona_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoicePolicyOverride>,
    /// Human-only annotation, excluded from evaluation (see `engine::dump_override`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Free-form tags used by group resolution (`list-groups`/`resolve-group`).
    /// Excluded from evaluation, same as `comment`.
    #[serde(default, rename = "groupTags", skip_serializing_if = "Option::is_none")]
    pub group_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelPolicy {
    #[serde(default)]
    pub default: ChatPolicyOverride,
    #[serde(default)]
    pub chats: BTreeMap<String, ChatPolicyOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimePolicy {
    #[serde(default = "bool_true", rename = "reloadOnChange")]
    pub reload_on_change: bool,
    #[serde(default = "default_reload_interval", rename = "reloadCheckIntervalSeconds")]
    pub reload_check_interval_seconds: f64,
    #[serde(default, rename = "featureFlags")]
    pub feature_flags: BTreeMap<String, bool>,
    #[serde(default = "default_rate_limit", rename = "adminCommandRateLimitPerMinute")]
    pub admin_command_rate_limit_per_minute: u32,
    #[serde(default, rename = "adminRequireConfirmForRisky", skip_serializing_if = "is_false")]
    pub admin_require_confirm_for_risky: bool,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            reload_on_change: true,
            reload_check_interval_seconds: default_reload_interval(),
            feature_flags: BTreeMap::new(),
            admin_command_rate_limit_per_minute: default_rate_limit(),
            admin_require_confirm_for_risky: false,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_reload_interval() -> f64 {
    1.0
}
fn default_rate_limit() -> u32 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryNotesDefaults {
    #[serde(default, rename = "dmsEnabled")]
    pub dms_enabled: bool,
    #[serde(default, rename = "groupsEnabled")]
    pub groups_enabled: bool,
    #[serde(default = "NotesMode::default_mode")]
    pub mode: NotesMode,
    #[serde(default, rename = "allowBlockedSenders")]
    pub allow_blocked_senders: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryNotesOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<NotesMode>,
    #[serde(default, rename = "allowBlockedSenders", skip_serializing_if = "Option::is_none")]
    pub allow_blocked_senders: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryNotesChannelConfig {
    #[serde(default)]
    pub default: MemoryNotesOverride,
    #[serde(default)]
    pub chats: BTreeMap<String, MemoryNotesOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryNotesBatch {
    #[serde(default = "default_batch_interval", rename = "intervalSeconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_batch_max", rename = "maxMessages")]
    pub max_messages: u32,
}

impl Default for MemoryNotesBatch {
    fn default() -> Self {
        Self {
            interval_seconds: default_batch_interval(),
            max_messages: default_batch_max(),
        }
    }
}

fn default_batch_interval() -> u64 {
    1800
}
fn default_batch_max() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryNotesPolicy {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default, rename = "applyChannels")]
    pub apply_channels: Vec<String>,
    #[serde(default)]
    pub defaults: MemoryNotesDefaults,
    #[serde(default)]
    pub batch: MemoryNotesBatch,
    #[serde(default)]
    pub channels: BTreeMap<String, MemoryNotesChannelConfig>,
}

impl Default for MemoryNotesPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            apply_channels: vec!["whatsapp".to_string(), "telegram".to_string()],
            defaults: MemoryNotesDefaults::default(),
            batch: MemoryNotesBatch::default(),
            channels: BTreeMap::new(),
        }
    }
}

/// Root of the hot-reloadable policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_owners")]
    pub owners: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub runtime: RuntimePolicy,
    #[serde(default = "default_policy_defaults")]
    pub defaults: ChatPolicy,
    #[serde(default = "default_channels")]
    pub channels: BTreeMap<String, ChannelPolicy>,
    #[serde(default, rename = "memoryNotes")]
    pub memory_notes: MemoryNotesPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            owners: default_owners(),
            runtime: RuntimePolicy::default(),
            defaults: default_policy_defaults(),
            channels: default_channels(),
            memory_notes: MemoryNotesPolicy::default(),
        }
    }
}

fn default_version() -> u32 {
    2
}

fn default_owners() -> BTreeMap<String, Vec<String>> {
    let mut owners = BTreeMap::new();
    owners.insert("telegram".to_string(), Vec::new());
    owners.insert("whatsapp".to_string(), Vec::new());
    owners
}

/// Conservative baseline: only read-only/lookup tools allowed by default.
fn default_policy_defaults() -> ChatPolicy {
    ChatPolicy {
        allowed_tools: AllowedToolsPolicy {
            mode: AllowedToolsMode::Allowlist,
            tools: vec![
                "list_dir".to_string(),
                "read_file".to_string(),
                "web_search".to_string(),
                "web_fetch".to_string(),
            ],
            deny: Vec::new(),
        },
        ..Default::default()
    }
}

fn default_channels() -> BTreeMap<String, ChannelPolicy> {
    let mention_only_default = || ChatPolicyOverride {
        when_to_reply: Some(WhenToReplyPolicyOverride {
            mode: Some(WhenToReplyMode::MentionOnly),
            senders: Some(Vec::new()),
        }),
        ..Default::default()
    };
    let mut channels = BTreeMap::new();
    channels.insert(
        "telegram".to_string(),
        ChannelPolicy {
            default: mention_only_default(),
            chats: BTreeMap::new(),
        },
    );
    channels.insert(
        "whatsapp".to_string(),
        ChannelPolicy {
            default: mention_only_default(),
            chats: BTreeMap::new(),
        },
    );
    channels
}
