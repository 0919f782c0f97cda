use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One physical chat message, normalized at the channel boundary.
///
/// Immutable by convention: middleware that needs to enrich it (e.g. the
/// reply-context stage) produces a modified clone rather than mutating in
/// place, matching how the pipeline threads `ctx.event` through the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Group-sender identity, distinct from `sender_id` on channels where a
    /// chat and a participant are addressed separately (e.g. WhatsApp JIDs).
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub mentioned_bot: bool,
    #[serde(default)]
    pub reply_to_bot: bool,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub reply_to_participant: Option<String>,
    #[serde(default)]
    pub reply_to_text: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub raw_metadata: BTreeMap<String, Value>,
}

impl InboundEvent {
    pub fn normalized_content(&self) -> &str {
        self.content.trim()
    }

    pub fn is_voice(&self) -> bool {
        self.raw_metadata
            .get("is_voice")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || self
                .raw_metadata
                .get("media_kind")
                .and_then(Value::as_str)
                .map(|s| s.eq_ignore_ascii_case("audio"))
                .unwrap_or(false)
    }
}

/// Reaction-only delivery signal carried in `OutboundEvent::metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionMeta {
    pub message_id: String,
    pub emoji: String,
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutboundEvent {
    pub channel: String,
    pub chat_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub reaction: Option<ReactionMeta>,
}

impl OutboundEvent {
    pub fn text(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}
