//! Stage 3: record the inbound event in the reply archive, seeding a
//! synthetic row for the quoted message when the payload carried one.
//! Pure side effect; never halts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use warden_core::{ArchivedMessage, ReplyArchivePort};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

pub struct ArchiveMiddleware {
    archive: Arc<dyn ReplyArchivePort>,
}

impl ArchiveMiddleware {
    pub fn new(archive: Arc<dyn ReplyArchivePort>) -> Self {
        Self { archive }
    }

    fn to_row(event: &warden_core::InboundEvent, message_id: String, content: String) -> Option<ArchivedMessage> {
        if message_id.trim().is_empty() {
            return None;
        }
        Some(ArchivedMessage {
            channel: event.channel.clone(),
            chat_id: event.chat_id.clone(),
            message_id,
            sender_id: event.sender_id.clone(),
            participant: event.participant.clone(),
            content,
            timestamp: event.timestamp,
            is_group: event.is_group,
        })
    }
}

#[async_trait]
impl Middleware for ArchiveMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let event = ctx.event.clone();

        if let Some(message_id) = event.message_id.clone() {
            if let Some(row) = Self::to_row(&event, message_id, event.content.clone()) {
                if let Err(e) = self.archive.record_inbound(&row).await {
                    warn!(error = %e, "reply_archive_record_failed");
                }
            }
        }

        if let (Some(reply_to_id), Some(reply_to_text)) =
            (event.reply_to_message_id.clone(), event.reply_to_text.clone())
        {
            if !reply_to_text.trim().is_empty() {
                if let Some(seed) = Self::to_row(&event, reply_to_id, reply_to_text) {
                    if let Err(e) = self.archive.record_inbound(&seed).await {
                        warn!(error = %e, "reply_archive_seed_failed");
                    }
                }
            }
        }

        next.run(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_event, InMemoryArchive};

    #[tokio::test]
    async fn records_inbound_and_seeds_reply_target() {
        let archive = Arc::new(InMemoryArchive::default());
        let mw = ArchiveMiddleware::new(archive.clone());

        let mut event = sample_event();
        event.reply_to_message_id = Some("anchor-1".to_string());
        event.reply_to_text = Some("quoted text".to_string());
        let mut ctx = PipelineContext::new(event);

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        let rows = archive.rows.lock().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.message_id == "anchor-1" && r.content == "quoted text"));
    }
}
