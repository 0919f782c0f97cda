//! The pipeline runner: an ordered chain of middleware, each given the
//! chance to pass through, short-circuit, or post-process around the rest
//! of the chain. Contains zero domain logic — every rule lives in a
//! middleware under `crate::middleware`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::PipelineContext;

/// The remaining slice of middleware after the one currently running.
/// Calling `run` recurses into the next layer, or returns immediately once
/// the chain is exhausted or the context is halted.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut PipelineContext) {
        if ctx.halted {
            return;
        }
        let Some((layer, rest)) = self.remaining.split_first() else {
            return;
        };
        let next = Next { remaining: rest };
        layer.call(ctx, next).await;
    }
}

/// One pipeline stage. Implementations choose one of three shapes:
///
/// 1. Pass through: mutate `ctx`, then `next.run(ctx).await`.
/// 2. Short-circuit: append intents, `ctx.halt()`, and return without
///    calling `next`.
/// 3. Post-process: `next.run(ctx).await`, then inspect/modify `ctx`.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>);
}

/// Ordered chain of middleware that processes one inbound event.
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self { layers }
    }

    /// Runs `ctx.event` through the full chain and returns the accumulated
    /// intents. The runner itself never inspects or special-cases any
    /// intent variant — that is the orchestrator's job.
    pub async fn run(&self, ctx: &mut PipelineContext) {
        let next = Next { remaining: &self.layers };
        next.run(ctx).await;
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::InboundEvent;

    struct Recorder(&'static str);

    #[async_trait]
    impl Middleware for Recorder {
        async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
            ctx.metric(self.0);
            next.run(ctx).await;
        }
    }

    struct Halter;

    #[async_trait]
    impl Middleware for Halter {
        async fn call(&self, ctx: &mut PipelineContext, _next: Next<'_>) {
            ctx.metric("halted_here");
            ctx.halt();
        }
    }

    fn sample_event() -> InboundEvent {
        InboundEvent {
            channel: "telegram".to_string(),
            chat_id: "c1".to_string(),
            sender_id: "s1".to_string(),
            content: "hi".to_string(),
            message_id: Some("m1".to_string()),
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

    #[tokio::test]
    async fn empty_pipeline_leaves_context_untouched() {
        let pipeline = Pipeline::new(Vec::new());
        let mut ctx = PipelineContext::new(sample_event());
        pipeline.run(&mut ctx).await;
        assert!(ctx.intents.is_empty());
        assert!(!ctx.halted);
    }

    #[tokio::test]
    async fn halting_layer_stops_the_chain() {
        let pipeline = Pipeline::new(vec![
            Arc::new(Recorder("first")),
            Arc::new(Halter),
            Arc::new(Recorder("never_runs")),
        ]);
        let mut ctx = PipelineContext::new(sample_event());
        pipeline.run(&mut ctx).await;
        assert!(ctx.halted);
        let names: Vec<&str> = ctx
            .intents
            .iter()
            .filter_map(|i| match i {
                warden_core::Intent::RecordMetric { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["first", "halted_here"]);
    }
}
