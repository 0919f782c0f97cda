use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single archived inbound message, keyed by `(channel, chat_id, message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub channel: String,
    pub chat_id: String,
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub participant: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_group: bool,
}

/// Storage boundary for inbound-message history, consulted by the
/// reply-context middleware and the admin `history` command.
#[async_trait]
pub trait ReplyArchivePort: Send + Sync {
    async fn record_inbound(&self, message: &ArchivedMessage) -> Result<()>;

    async fn lookup_message(
        &self,
        channel: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<ArchivedMessage>>;

    /// Looks up a message by id across all chats on a channel, used when a
    /// reply references a message the current chat's window no longer has.
    /// `preferred_chat_id`, when given, is tried first before the unordered
    /// channel-wide scan.
    async fn lookup_message_any_chat(
        &self,
        channel: &str,
        message_id: &str,
        preferred_chat_id: Option<&str>,
    ) -> Result<Option<ArchivedMessage>>;

    /// Returns up to `limit` messages strictly before `before`, newest first.
    async fn lookup_messages_before(
        &self,
        channel: &str,
        chat_id: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ArchivedMessage>>;
}
