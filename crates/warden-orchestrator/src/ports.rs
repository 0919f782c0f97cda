//! Orchestrator-local ports: trait surfaces for intent targets that live
//! outside `warden-core` because they're channel/adapter-layer concerns, not
//! pipeline-domain concerns (mirrors how `yeoman.adapters.typing_channel_manager`
//! sits in the adapters layer rather than `yeoman.core`).

use async_trait::async_trait;
use tracing::debug;

/// Drives a channel's typing indicator. Implemented by whichever channel
/// adapter owns the underlying connection (e.g. a WhatsApp bridge client);
/// the orchestrator only knows it can be turned on and off per chat.
#[async_trait]
pub trait TypingNotifierPort: Send + Sync {
    async fn set_typing(&self, channel: &str, chat_id: &str, enabled: bool);
}

/// No channel adapter wired in; logs and does nothing.
pub struct NullTypingNotifier;

#[async_trait]
impl TypingNotifierPort for NullTypingNotifier {
    async fn set_typing(&self, channel: &str, chat_id: &str, enabled: bool) {
        debug!(channel, chat_id, enabled, "set_typing (no adapter wired in)");
    }
}
