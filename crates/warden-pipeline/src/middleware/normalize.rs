//! Stage 1: strip whitespace, drop events with no content left.

use async_trait::async_trait;

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

pub struct NormalizationMiddleware;

#[async_trait]
impl Middleware for NormalizationMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let normalized = ctx.event.normalized_content().to_string();
        if normalized.is_empty() {
            ctx.metric_with(
                "event_drop_empty",
                1,
                vec![("channel".to_string(), ctx.event.channel.clone())],
            );
            ctx.halt();
            return;
        }
        ctx.event.content = normalized;
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
    async fn empty_content_halts_with_metric() {
        let mut event = sample_event();
        event.content = "   ".to_string();
        let mut ctx = PipelineContext::new(event);
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(NormalizationMiddleware)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(matches!(&ctx.intents[0], Intent::RecordMetric { name, .. } if name == "event_drop_empty"));
    }

    #[tokio::test]
    async fn whitespace_is_trimmed_and_chain_continues() {
        let mut event = sample_event();
        event.content = "  hello  ".to_string();
        let mut ctx = PipelineContext::new(event);
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(NormalizationMiddleware)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(!ctx.halted);
        assert_eq!(ctx.event.content, "hello");
    }
}
