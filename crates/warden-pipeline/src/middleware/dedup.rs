//! Stage 2: TTL-based `(channel, chat_id, message_id)` dedup.
//!
//! Events without a `message_id` skip dedup entirely — channels that never
//! assign stable ids can't be deduplicated and shouldn't be penalized for it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

pub struct DeduplicationMiddleware {
    ttl: Duration,
    recent: DashMap<String, Instant>,
    next_cleanup_at: Mutex<Instant>,
}

impl DeduplicationMiddleware {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds.max(1)),
            recent: DashMap::new(),
            next_cleanup_at: Mutex::new(Instant::now()),
        }
    }

    fn dedup_key(ctx: &PipelineContext) -> Option<String> {
        let message_id = ctx.event.message_id.as_ref()?;
        Some(format!("{}:{}:{}", ctx.event.channel, ctx.event.chat_id, message_id))
    }

    async fn maybe_cleanup(&self, now: Instant) {
        let mut next = self.next_cleanup_at.lock().await;
        if now < *next {
            return;
        }
        self.recent.retain(|_, expires_at| *expires_at > now);
        *next = now + CLEANUP_INTERVAL;
    }
}

#[async_trait]
impl Middleware for DeduplicationMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let Some(key) = Self::dedup_key(ctx) else {
            next.run(ctx).await;
            return;
        };

        let now = Instant::now();
        self.maybe_cleanup(now).await;

        if let Some(expires_at) = self.recent.get(&key) {
            if *expires_at > now {
                ctx.metric_with(
                    "event_drop_duplicate",
                    1,
                    vec![("channel".to_string(), ctx.event.channel.clone())],
                );
                ctx.halt();
                return;
            }
        }

        self.recent.insert(key, now + self.ttl);
        next.run(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_event;
    use std::sync::Arc;
    use warden_core::Intent;

    #[tokio::test]
    async fn second_event_with_same_key_is_dropped() {
        let mw: Arc<dyn Middleware> = Arc::new(DeduplicationMiddleware::new(1200));
        let pipeline = crate::runner::Pipeline::new(vec![mw]);

        let mut first = PipelineContext::new(sample_event());
        pipeline.run(&mut first).await;
        assert!(!first.halted);

        let mut second = PipelineContext::new(sample_event());
        pipeline.run(&mut second).await;
        assert!(second.halted);
        assert!(matches!(&second.intents[0], Intent::RecordMetric { name, .. } if name == "event_drop_duplicate"));
    }

    #[tokio::test]
    async fn events_without_message_id_skip_dedup() {
        let mw: Arc<dyn Middleware> = Arc::new(DeduplicationMiddleware::new(1200));
        let pipeline = crate::runner::Pipeline::new(vec![mw]);

        let mut event = sample_event();
        event.message_id = None;
        let mut first = PipelineContext::new(event.clone());
        pipeline.run(&mut first).await;
        let mut second = PipelineContext::new(event);
        pipeline.run(&mut second).await;

        assert!(!first.halted);
        assert!(!second.halted);
    }
}
