use serde::{Deserialize, Serialize};

use crate::event::OutboundEvent;
use crate::types::NotesMode;

/// Kind tag for manually-recorded memory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualMemoryKind {
    Idea,
    Backlog,
}

/// Value produced by a middleware; executed by the orchestrator after the
/// pipeline completes, in append order.
///
/// Intentionally exhaustive: a dispatcher that does not handle every variant
/// fails to compile, per the intent-dispatch discipline this type encodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    SetTyping {
        channel: String,
        chat_id: String,
        enabled: bool,
    },
    SendOutbound {
        event: OutboundEvent,
    },
    SendReaction {
        channel: String,
        chat_id: String,
        message_id: String,
        emoji: String,
        participant: Option<String>,
    },
    PersistSession {
        session_key: String,
        user_content: String,
        assistant_content: String,
    },
    QueueMemoryNotesCapture {
        channel: String,
        chat_id: String,
        sender_id: String,
        message_id: Option<String>,
        content: String,
        is_group: bool,
        mode: NotesMode,
        batch_interval_seconds: u64,
        batch_max_messages: u32,
    },
    RecordManualMemory {
        channel: String,
        chat_id: String,
        sender_id: String,
        content: String,
        kind: ManualMemoryKind,
    },
    RecordMetric {
        name: String,
        value: i64,
        labels: Vec<(String, String)>,
    },
}
