use serde::{Deserialize, Serialize};

/// When a job is due to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire every `every_ms` milliseconds, starting `every_ms` after creation
    /// (or after the previous fire).
    Every { every_ms: u64 },
    /// Fire according to a standard five-field cron expression, in UTC.
    Cron { expr: String },
    /// Fire exactly once at the given UTC epoch milliseconds, then be removed.
    At { at_ms: i64 },
}

/// What a fired job does once its schedule is due.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Runs a direct prompt through the responder. Optionally delivered to a
    /// specific `(channel, chat_id)` pair rather than just logged.
    Text {
        message: String,
        #[serde(default)]
        deliver: bool,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        channel: Option<String>,
    },
    /// Chooses a phrase from a fixed list and invokes `send_voice` directly,
    /// bypassing the responder.
    VoiceBroadcast {
        messages: Vec<String>,
        #[serde(default = "bool_true")]
        randomize: bool,
        #[serde(default)]
        group: Option<String>,
        #[serde(default)]
        chat_id: Option<String>,
        channel: String,
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        tts_route: Option<String>,
        #[serde(default = "bool_true")]
        verbatim: bool,
        #[serde(default)]
        max_sentences: Option<u32>,
        #[serde(default)]
        max_chars: Option<u32>,
    },
}

fn bool_true() -> bool {
    true
}

/// A persisted scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: Payload,
    /// One-shot `at` jobs are deleted after their single execution
    /// regardless of this flag; voice jobs on a recurring schedule may also
    /// opt into delete-after-run semantics (mirrors the CLI's `--at` implying
    /// `delete_after_run`).
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(default)]
    pub next_run_at_ms: Option<i64>,
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub run_count: u64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}
