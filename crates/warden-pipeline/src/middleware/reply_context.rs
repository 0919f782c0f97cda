//! Stage 4 (WhatsApp-only): enrich the event with ambient and reply-context
//! windows pulled from the reply archive, injected into `raw_metadata`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use warden_core::{ArchivedMessage, InboundEvent, ReplyArchivePort};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

pub struct ReplyContextMiddleware {
    archive: Arc<dyn ReplyArchivePort>,
    reply_window_limit: usize,
    line_max_chars: usize,
    ambient_limit: usize,
}

impl ReplyContextMiddleware {
    pub fn new(
        archive: Arc<dyn ReplyArchivePort>,
        reply_context_window_limit: usize,
        reply_context_line_max_chars: usize,
        ambient_window_limit: usize,
    ) -> Self {
        Self {
            archive,
            reply_window_limit: reply_context_window_limit.max(1),
            line_max_chars: reply_context_line_max_chars.max(32),
            ambient_limit: ambient_window_limit,
        }
    }

    fn format_lines(&self, mut rows: Vec<ArchivedMessage>) -> Vec<String> {
        // `lookup_messages_before` returns newest-first; display oldest-first.
        rows.reverse();
        let mut lines = Vec::with_capacity(rows.len());
        for row in &rows {
            let compact: String = row.content.split_whitespace().collect::<Vec<_>>().join(" ");
            if compact.is_empty() {
                continue;
            }
            let truncated = if compact.chars().count() > self.line_max_chars {
                let head: String = compact.chars().take(self.line_max_chars).collect();
                format!("{head}...")
            } else {
                compact
            };
            let speaker = row
                .participant
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(row.sender_id.as_str());
            let speaker = if speaker.trim().is_empty() { "unknown" } else { speaker.trim() };
            lines.push(format!("[{speaker}] {truncated}"));
        }
        let cap = self.reply_window_limit.max(self.ambient_limit);
        lines.truncate(cap);
        lines
    }

    async fn build_ambient_window(&self, event: &InboundEvent) -> Vec<String> {
        let Some(_) = event.message_id.as_ref() else {
            return Vec::new();
        };
        if self.ambient_limit == 0 {
            return Vec::new();
        }
        match self
            .archive
            .lookup_messages_before(&event.channel, &event.chat_id, event.timestamp, self.ambient_limit)
            .await
        {
            Ok(rows) => self.format_lines(rows),
            Err(_) => Vec::new(),
        }
    }

    async fn build_reply_context_window(&self, event: &InboundEvent, anchor: &ArchivedMessage) -> Vec<String> {
        if anchor.message_id.is_empty() || anchor.sender_id.is_empty() {
            return Vec::new();
        }
        let chat_id = if anchor.chat_id.is_empty() { &event.chat_id } else { &anchor.chat_id };
        match self
            .archive
            .lookup_messages_before(&event.channel, chat_id, anchor.timestamp, self.reply_window_limit)
            .await
        {
            Ok(rows) => self.format_lines(rows),
            Err(_) => Vec::new(),
        }
    }

    /// Returns the enriched event, whether an archive lookup was attempted,
    /// and whether it produced a hit — mirroring the three-value contract
    /// the metric emission below depends on.
    async fn resolve(&self, event: InboundEvent) -> (InboundEvent, bool, bool) {
        if event.channel != "whatsapp" {
            return (event, false, false);
        }

        let reply_to_message_id = event.reply_to_message_id.as_deref().unwrap_or("").trim().to_string();
        let has_payload_reply_text = event.reply_to_text.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        let ambient_lines = self.build_ambient_window(&event).await;

        if reply_to_message_id.is_empty() {
            if has_payload_reply_text || !ambient_lines.is_empty() {
                let event = Self::with_windows(event, has_payload_reply_text, None, ambient_lines);
                return (event, false, false);
            }
            return (event, false, false);
        }

        let row = match self.archive.lookup_message(&event.channel, &event.chat_id, &reply_to_message_id).await {
            Ok(Some(row)) => Some(row),
            _ => None,
        };
        let row = match row {
            Some(row) => Some(row),
            None => self
                .archive
                .lookup_message_any_chat(&event.channel, &reply_to_message_id, Some(&event.chat_id))
                .await
                .ok()
                .flatten(),
        };

        let Some(row) = row else {
            if has_payload_reply_text || !ambient_lines.is_empty() {
                let event = Self::with_windows(event, has_payload_reply_text, None, ambient_lines);
                return (event, true, false);
            }
            return (event, true, false);
        };

        let window_lines = self.build_reply_context_window(&event, &row).await;
        let mut event = Self::with_windows(event, has_payload_reply_text, Some(window_lines), ambient_lines);

        if has_payload_reply_text {
            return (event, true, true);
        }

        let text = row.content.trim().to_string();
        if text.is_empty() {
            return (event, true, false);
        }
        event.reply_to_text = Some(text);
        event
            .raw_metadata
            .insert("reply_context_source".to_string(), json!("archive"));
        (event, true, true)
    }

    fn with_windows(
        mut event: InboundEvent,
        has_payload_reply_text: bool,
        reply_window: Option<Vec<String>>,
        ambient_window: Vec<String>,
    ) -> InboundEvent {
        if has_payload_reply_text {
            event
                .raw_metadata
                .entry("reply_context_source".to_string())
                .or_insert_with(|| json!("payload"));
        } else if reply_window.is_some() {
            event
                .raw_metadata
                .entry("reply_context_source".to_string())
                .or_insert_with(|| json!("archive"));
        }
        if let Some(lines) = reply_window {
            if !lines.is_empty() {
                event.raw_metadata.insert("reply_context_window".to_string(), json!(lines));
            }
        }
        if !ambient_window.is_empty() {
            event.raw_metadata.insert("ambient_context_window".to_string(), json!(ambient_window));
        }
        event
    }
}

#[async_trait]
impl Middleware for ReplyContextMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let event = std::mem::replace(&mut ctx.event, placeholder_event());
        let (event, lookup_attempted, archive_hit) = self.resolve(event).await;
        let channel = event.channel.clone();
        ctx.event = event;

        if channel == "whatsapp" && lookup_attempted {
            let metric_name = if archive_hit { "reply_ctx_archive_hit" } else { "reply_ctx_archive_miss" };
            ctx.metric_with(metric_name, 1, vec![("channel".to_string(), channel)]);
        }

        next.run(ctx).await;
    }
}

fn placeholder_event() -> InboundEvent {
    InboundEvent {
        channel: String::new(),
        chat_id: String::new(),
        sender_id: String::new(),
        content: String::new(),
        message_id: None,
        timestamp: chrono::Utc::now(),
        participant: None,
        is_group: false,
        mentioned_bot: false,
        reply_to_bot: false,
        reply_to_message_id: None,
        reply_to_participant: None,
        reply_to_text: None,
        media: Vec::new(),
        raw_metadata: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_event;

    #[tokio::test]
    async fn non_whatsapp_channel_is_left_untouched() {
        let archive = Arc::new(crate::test_support::InMemoryArchive::default());
        let mw = ReplyContextMiddleware::new(archive, 6, 500, 8);
        let mut ctx = PipelineContext::new(sample_event());
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;
        assert!(!ctx.halted);
        assert!(ctx.event.raw_metadata.is_empty());
    }

    #[tokio::test]
    async fn archive_hit_enriches_reply_to_text_and_emits_metric() {
        let archive = Arc::new(crate::test_support::InMemoryArchive::default());
        let anchor = ArchivedMessage {
            channel: "whatsapp".to_string(),
            chat_id: "c1".to_string(),
            message_id: "anchor-1".to_string(),
            sender_id: "bob".to_string(),
            participant: None,
            content: "original question".to_string(),
            timestamp: chrono::Utc::now() - chrono::Duration::seconds(30),
            is_group: false,
        };
        archive.record_inbound(&anchor).await.unwrap();

        let mw = ReplyContextMiddleware::new(archive, 6, 500, 8);
        let mut event = sample_event();
        event.channel = "whatsapp".to_string();
        event.reply_to_message_id = Some("anchor-1".to_string());
        event.reply_to_text = None;
        let mut ctx = PipelineContext::new(event);
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert_eq!(ctx.event.reply_to_text.as_deref(), Some("original question"));
        assert!(matches!(&ctx.intents[0], warden_core::Intent::RecordMetric { name, .. } if name == "reply_ctx_archive_hit"));
    }
}
