//! Stage 7A (WhatsApp-only): detect `[idea]`/`[backlog]`-prefixed messages
//! and capture them as manual memory entries with a reaction, bypassing the
//! responder entirely.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use unicode_normalization::char::decompose_canonical;
use warden_core::{Intent, ManualMemoryKind, OutboundEvent, ReactionMeta, SecurityAction, SecurityPort};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

const IDEA_MARKERS: &[&str] = &["[idea]", "#idea", "idea:", "inbox idea"];
const BACKLOG_MARKERS: &[&str] = &["[backlog]", "#backlog", "backlog:"];

static IDEA_PREFIX_WORDS: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    ["idea", "idee", "ideia", "идея", "아이디어", "アイデア", "想法"].into_iter().collect()
});
static IDEA_PREFIX_PHRASES: Lazy<std::collections::HashSet<&'static str>> =
    Lazy::new(|| ["new idea", "inbox idea"].into_iter().collect());
static BACKLOG_PREFIX_WORDS: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    ["backlog", "todo", "aufgabe", "aufgaben", "tache", "tarea", "задача", "任务", "할일"]
        .into_iter()
        .collect()
});
static BACKLOG_PREFIX_PHRASES: Lazy<std::collections::HashSet<&'static str>> =
    Lazy::new(|| ["to do"].into_iter().collect());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureKind {
    Idea,
    Backlog,
}

impl CaptureKind {
    fn as_str(self) -> &'static str {
        match self {
            CaptureKind::Idea => "idea",
            CaptureKind::Backlog => "backlog",
        }
    }
}

fn fold_accents(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        decompose_canonical(ch, |c| {
            if !is_combining_mark(c) {
                out.push(c);
            }
        });
    }
    out
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF)
}

/// A word token: an alphanumeric run, matching Python's `[^\W_]+` regex.
struct Token {
    text: String,
    end_byte: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_end = 0;
    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            current.push(ch);
            current_end = idx + ch.len_utf8();
        } else if !current.is_empty() {
            tokens.push(Token { text: std::mem::take(&mut current), end_byte: current_end });
        }
    }
    if !current.is_empty() {
        tokens.push(Token { text: current, end_byte: current_end });
    }
    tokens
}

fn capture_kind_and_body(content: &str) -> Option<(CaptureKind, String)> {
    let text = content.trim();
    if text.is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();

    for marker in BACKLOG_MARKERS {
        if lowered.starts_with(marker) {
            let body = text[marker.len()..].trim_start_matches([' ', '\t', ':', ';', '.', ',', '-']);
            let body = if body.is_empty() { text } else { body };
            return Some((CaptureKind::Backlog, body.to_string()));
        }
    }
    for marker in IDEA_MARKERS {
        if lowered.starts_with(marker) {
            let body = text[marker.len()..].trim_start_matches([' ', '\t', ':', ';', '.', ',', '-']);
            let body = if body.is_empty() { text } else { body };
            return Some((CaptureKind::Idea, body.to_string()));
        }
    }

    let tokens = tokenize(text);
    let first_token = tokens.first()?;
    let first = fold_accents(&first_token.text).to_lowercase();
    let mut first_two = first.clone();
    let mut first_three = first.clone();
    if let Some(second_token) = tokens.get(1) {
        let second = fold_accents(&second_token.text).to_lowercase();
        first_two = format!("{first} {second}");
        first_three = first_two.clone();
    }
    if let Some(third_token) = tokens.get(2) {
        let third = fold_accents(&third_token.text).to_lowercase();
        first_three = format!("{first_two} {third}");
    }

    let mut cut_at = first_token.end_byte;
    let kind;
    if BACKLOG_PREFIX_WORDS.contains(first.as_str())
        || BACKLOG_PREFIX_PHRASES.contains(first_two.as_str())
        || BACKLOG_PREFIX_PHRASES.contains(first_three.as_str())
    {
        kind = CaptureKind::Backlog;
        if BACKLOG_PREFIX_PHRASES.contains(first_three.as_str()) && tokens.len() >= 3 {
            cut_at = tokens[2].end_byte;
        } else if BACKLOG_PREFIX_PHRASES.contains(first_two.as_str()) && tokens.len() >= 2 {
            cut_at = tokens[1].end_byte;
        }
    } else if IDEA_PREFIX_WORDS.contains(first.as_str())
        || IDEA_PREFIX_PHRASES.contains(first_two.as_str())
        || IDEA_PREFIX_PHRASES.contains(first_three.as_str())
    {
        kind = CaptureKind::Idea;
        if IDEA_PREFIX_PHRASES.contains(first_three.as_str()) && tokens.len() >= 3 {
            cut_at = tokens[2].end_byte;
        } else if IDEA_PREFIX_PHRASES.contains(first_two.as_str()) && tokens.len() >= 2 {
            cut_at = tokens[1].end_byte;
        }
    } else {
        return None;
    }

    let body = text[cut_at..].trim_start_matches([' ', '\t', ':', ';', '.', ',', '-']);
    let body = if body.is_empty() { text } else { body };
    Some((kind, body.to_string()))
}

pub struct IdeaCaptureMiddleware {
    security: Arc<dyn SecurityPort>,
}

impl IdeaCaptureMiddleware {
    pub fn new(security: Arc<dyn SecurityPort>) -> Self {
        Self { security }
    }
}

#[async_trait]
impl Middleware for IdeaCaptureMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        if ctx.event.channel != "whatsapp" {
            next.run(ctx).await;
            return;
        }
        let accepted = ctx.decision.as_ref().map(|d| d.accept_message).unwrap_or(false);
        if !accepted {
            next.run(ctx).await;
            return;
        }

        let Some((kind, body)) = capture_kind_and_body(&ctx.event.content) else {
            next.run(ctx).await;
            return;
        };

        let canonical = format!("[{}] {}", kind.as_str().to_uppercase(), body).trim().to_string();

        let mut context = BTreeMap::new();
        context.insert("channel".to_string(), serde_json::json!(ctx.event.channel));
        context.insert("chat_id".to_string(), serde_json::json!(ctx.event.chat_id));
        context.insert("sender_id".to_string(), serde_json::json!(ctx.event.sender_id));
        context.insert("message_id".to_string(), serde_json::json!(ctx.event.message_id.clone().unwrap_or_default()));
        context.insert("path".to_string(), serde_json::json!("idea_capture"));

        let result = self.security.check_input(&canonical, &context);
        if result.action == SecurityAction::Block {
            ctx.metric_with(
                "security_input_blocked",
                1,
                vec![
                    ("channel".to_string(), ctx.event.channel.clone()),
                    ("reason".to_string(), result.reason.clone().unwrap_or_default()),
                ],
            );
            ctx.metric_with(
                "idea_capture_dropped_security",
                1,
                vec![("channel".to_string(), ctx.event.channel.clone()), ("kind".to_string(), kind.as_str().to_string())],
            );
            ctx.halt();
            return;
        }

        let manual_kind = match kind {
            CaptureKind::Idea => ManualMemoryKind::Idea,
            CaptureKind::Backlog => ManualMemoryKind::Backlog,
        };
        ctx.intents.push(Intent::RecordManualMemory {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            sender_id: ctx.event.sender_id.clone(),
            content: canonical,
            kind: manual_kind,
        });
        ctx.metric_with(
            "idea_capture_saved",
            1,
            vec![("channel".to_string(), ctx.event.channel.clone()), ("kind".to_string(), kind.as_str().to_string())],
        );

        if let Some(message_id) = ctx.event.message_id.clone() {
            let emoji = if kind == CaptureKind::Backlog { "\u{1F4CC}" } else { "\u{1F4A1}" };
            ctx.intents.push(Intent::SendOutbound {
                event: OutboundEvent {
                    channel: ctx.event.channel.clone(),
                    chat_id: ctx.event.chat_id.clone(),
                    content: String::new(),
                    reply_to: None,
                    media: Vec::new(),
                    reaction: Some(ReactionMeta {
                        message_id,
                        emoji: emoji.to_string(),
                        participant: ctx.event.participant.clone(),
                        from_me: false,
                    }),
                },
            });
            ctx.metric_with(
                "idea_capture_reacted",
                1,
                vec![("channel".to_string(), ctx.event.channel.clone()), ("kind".to_string(), kind.as_str().to_string())],
            );
        } else {
            ctx.metric_with(
                "idea_capture_no_message_id",
                1,
                vec![("channel".to_string(), ctx.event.channel.clone()), ("kind".to_string(), kind.as_str().to_string())],
            );
        }

        ctx.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_event, ScriptedSecurity};

    #[tokio::test]
    async fn bracket_marker_captures_as_idea() {
        let mw = IdeaCaptureMiddleware::new(Arc::new(ScriptedSecurity::default()));
        let mut event = sample_event();
        event.channel = "whatsapp".to_string();
        event.content = "[idea] ship the offline mode".to_string();
        let mut ctx = PipelineContext::new(event);
        ctx.decision = Some(crate::test_support::accepted_decision());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(matches!(&ctx.intents[0], Intent::RecordManualMemory { content, kind: ManualMemoryKind::Idea, .. } if content == "[IDEA] ship the offline mode"));
    }

    #[tokio::test]
    async fn bare_prefix_word_captures_as_backlog() {
        let mw = IdeaCaptureMiddleware::new(Arc::new(ScriptedSecurity::default()));
        let mut event = sample_event();
        event.channel = "whatsapp".to_string();
        event.content = "todo buy milk".to_string();
        let mut ctx = PipelineContext::new(event);
        ctx.decision = Some(crate::test_support::accepted_decision());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(matches!(&ctx.intents[0], Intent::RecordManualMemory { content, kind: ManualMemoryKind::Backlog, .. } if content == "[BACKLOG] buy milk"));
    }

    #[tokio::test]
    async fn unrelated_message_passes_through() {
        let mw = IdeaCaptureMiddleware::new(Arc::new(ScriptedSecurity::default()));
        let mut event = sample_event();
        event.channel = "whatsapp".to_string();
        event.content = "how's the weather".to_string();
        let mut ctx = PipelineContext::new(event);
        ctx.decision = Some(crate::test_support::accepted_decision());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(!ctx.halted);
        assert!(ctx.intents.is_empty());
    }
}
