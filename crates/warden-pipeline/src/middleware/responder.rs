//! Stages 11-12: drive the typing indicator and delegate to the
//! `ResponderPort` for an LLM reply, storing it in `ctx.reply`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use warden_core::{Intent, ResponderPort};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

pub struct ResponderMiddleware {
    responder: Arc<dyn ResponderPort>,
}

impl ResponderMiddleware {
    pub fn new(responder: Arc<dyn ResponderPort>) -> Self {
        Self { responder }
    }

    fn set_typing(ctx: &mut PipelineContext, enabled: bool) {
        ctx.intents.push(Intent::SetTyping {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            enabled,
        });
    }
}

#[async_trait]
impl Middleware for ResponderMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        if ctx.decision.is_none() {
            next.run(ctx).await;
            return;
        }

        let typing_started = ctx.event.channel == "whatsapp";
        if typing_started {
            Self::set_typing(ctx, true);
        }

        // decision is checked above; clone it so the borrow on ctx ends
        // before we hand ctx to the responder.
        let decision = ctx.decision.clone().expect("decision checked above");
        let reply = self.responder.generate_reply(&ctx.event, &decision).await;

        match reply {
            Ok(Some(reply)) if !reply.trim().is_empty() => {
                ctx.reply = Some(reply);
                next.run(ctx).await;
            }
            Ok(_) => {
                ctx.metric_with("responder_empty", 1, vec![("channel".to_string(), ctx.event.channel.clone())]);
                ctx.halt();
            }
            Err(e) => {
                warn!(error = %e, "responder_generate_reply_failed");
                ctx.metric_with("responder_error", 1, vec![("channel".to_string(), ctx.event.channel.clone())]);
                ctx.halt();
            }
        }

        if typing_started {
            Self::set_typing(ctx, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{accepted_decision, sample_event, StubResponder};

    #[tokio::test]
    async fn whatsapp_reply_toggles_typing_and_stores_reply() {
        let mw = ResponderMiddleware::new(Arc::new(StubResponder { reply: Some("hi there".to_string()) }));
        let mut event = sample_event();
        event.channel = "whatsapp".to_string();
        let mut ctx = PipelineContext::new(event);
        ctx.decision = Some(accepted_decision());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert_eq!(ctx.reply.as_deref(), Some("hi there"));
        assert!(matches!(&ctx.intents[0], Intent::SetTyping { enabled: true, .. }));
        assert!(matches!(ctx.intents.last().unwrap(), Intent::SetTyping { enabled: false, .. }));
    }

    #[tokio::test]
    async fn empty_reply_halts_and_still_stops_typing() {
        let mw = ResponderMiddleware::new(Arc::new(StubResponder { reply: None }));
        let mut event = sample_event();
        event.channel = "whatsapp".to_string();
        let mut ctx = PipelineContext::new(event);
        ctx.decision = Some(accepted_decision());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(ctx.intents.iter().any(|i| matches!(i, Intent::SetTyping { enabled: false, .. })));
        assert!(ctx.intents.iter().any(|i| matches!(i, Intent::RecordMetric { name, .. } if name == "responder_empty")));
    }

    #[tokio::test]
    async fn non_whatsapp_channel_skips_typing_intents() {
        let mw = ResponderMiddleware::new(Arc::new(StubResponder { reply: Some("ok".to_string()) }));
        let mut ctx = PipelineContext::new(sample_event());
        ctx.decision = Some(accepted_decision());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(!ctx.intents.iter().any(|i| matches!(i, Intent::SetTyping { .. })));
    }
}
