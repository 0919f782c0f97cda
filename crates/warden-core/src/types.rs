use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a conversation for session-persistence purposes.
///
/// Format: `{channel}:{chat_id}` — mirrors the key the outbound-assembly
/// stage uses when it emits a `PersistSession` intent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn for_chat(channel: &str, chat_id: &str) -> Self {
        Self(format!("{channel}:{chat_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// When the bot should generate a reply after a message is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenToReplyMode {
    All,
    MentionOnly,
    AllowedSenders,
    OwnerOnly,
    Off,
}

impl fmt::Display for WhenToReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WhenToReplyMode::All => "all",
            WhenToReplyMode::MentionOnly => "mention_only",
            WhenToReplyMode::AllowedSenders => "allowed_senders",
            WhenToReplyMode::OwnerOnly => "owner_only",
            WhenToReplyMode::Off => "off",
        };
        write!(f, "{s}")
    }
}

impl WhenToReplyMode {
    /// serde default-fn for the policy schema; `all` matches the original
    /// nanobot/yeoman defaults for a chat policy with no explicit setting.
    pub fn default_mode() -> Self {
        WhenToReplyMode::All
    }
}

/// Who is allowed to address the bot at all (evaluated before `when_to_reply`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhoCanTalkMode {
    Everyone,
    Allowlist,
    OwnerOnly,
}

impl fmt::Display for WhoCanTalkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WhoCanTalkMode::Everyone => "everyone",
            WhoCanTalkMode::Allowlist => "allowlist",
            WhoCanTalkMode::OwnerOnly => "owner_only",
        };
        write!(f, "{s}")
    }
}

impl WhoCanTalkMode {
    pub fn default_mode() -> Self {
        WhoCanTalkMode::Everyone
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedToolsMode {
    All,
    Allowlist,
}

impl AllowedToolsMode {
    pub fn default_mode() -> Self {
        AllowedToolsMode::All
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccessMode {
    Everyone,
    Allowlist,
    OwnerOnly,
}

impl ToolAccessMode {
    pub fn default_mode() -> Self {
        ToolAccessMode::Everyone
    }
}

/// Background memory-notes capture strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotesMode {
    Adaptive,
    Heuristic,
    Hybrid,
}

impl NotesMode {
    pub fn default_mode() -> Self {
        NotesMode::Adaptive
    }
}

impl fmt::Display for NotesMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotesMode::Adaptive => "adaptive",
            NotesMode::Heuristic => "heuristic",
            NotesMode::Hybrid => "hybrid",
        };
        write!(f, "{s}")
    }
}

/// Voice-reply synthesis policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceOutputMode {
    Text,
    InKind,
    Always,
    Off,
}

impl VoiceOutputMode {
    pub fn default_mode() -> Self {
        VoiceOutputMode::Text
    }
}

impl fmt::Display for VoiceOutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VoiceOutputMode::Text => "text",
            VoiceOutputMode::InKind => "in_kind",
            VoiceOutputMode::Always => "always",
            VoiceOutputMode::Off => "off",
        };
        write!(f, "{s}")
    }
}
