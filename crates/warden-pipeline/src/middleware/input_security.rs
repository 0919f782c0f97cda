//! Stage 10: regex-based input security check, with an optional async LLM
//! classifier as a second layer. Blocks with a reaction (if the channel gave
//! us a message id) or a fallback text reply.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use warden_core::{Intent, LlmClassifierPort, LlmRisk, OutboundEvent, SecurityAction, SecurityPort};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

pub struct InputSecurityMiddleware {
    security: Arc<dyn SecurityPort>,
    llm_classifier: Option<Arc<dyn LlmClassifierPort>>,
    block_message: String,
}

impl InputSecurityMiddleware {
    pub fn new(security: Arc<dyn SecurityPort>, llm_classifier: Option<Arc<dyn LlmClassifierPort>>, block_message: String) -> Self {
        Self { security, llm_classifier, block_message }
    }

    fn block(&self, ctx: &mut PipelineContext, reason: &str) {
        ctx.metric_with(
            "security_input_blocked",
            1,
            vec![("channel".to_string(), ctx.event.channel.clone()), ("reason".to_string(), reason.to_string())],
        );

        if let Some(message_id) = ctx.event.message_id.clone() {
            ctx.intents.push(Intent::SendReaction {
                channel: ctx.event.channel.clone(),
                chat_id: ctx.event.chat_id.clone(),
                message_id,
                emoji: self.block_message.clone(),
                participant: ctx.event.participant.clone(),
            });
        } else {
            ctx.intents.push(Intent::SendOutbound {
                event: OutboundEvent::text(ctx.event.channel.clone(), ctx.event.chat_id.clone(), self.block_message.clone()),
            });
        }
        ctx.halt();
    }
}

#[async_trait]
impl Middleware for InputSecurityMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let mut context: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        context.insert("channel".to_string(), serde_json::json!(ctx.event.channel));
        context.insert("chat_id".to_string(), serde_json::json!(ctx.event.chat_id));
        context.insert("sender_id".to_string(), serde_json::json!(ctx.event.sender_id));
        context.insert("message_id".to_string(), serde_json::json!(ctx.event.message_id.clone().unwrap_or_default()));

        let result = self.security.check_input(&ctx.event.content, &context);
        if result.action == SecurityAction::Block {
            let reason = result.reason.clone().unwrap_or_default();
            self.block(ctx, &reason);
            return;
        }

        if let Some(classifier) = &self.llm_classifier {
            match classifier.classify(&ctx.event.content).await {
                Ok(LlmRisk::High) => {
                    self.block(ctx, "llm_classifier_high_risk");
                    return;
                }
                Ok(LlmRisk::Medium) => {
                    ctx.metric_with(
                        "security_input_llm_warn",
                        1,
                        vec![("channel".to_string(), ctx.event.channel.clone())],
                    );
                }
                Ok(LlmRisk::Low) => {}
                Err(e) => {
                    warn!(error = %e, "llm_classifier_failed_open");
                }
            }
        }

        next.run(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_event;

    struct BlockingSecurity;
    impl SecurityPort for BlockingSecurity {
        fn check_input(&self, _text: &str, _ctx: &BTreeMap<String, serde_json::Value>) -> warden_core::SecurityResult {
            warden_core::SecurityResult {
                stage: warden_core::SecurityStage::Input,
                action: SecurityAction::Block,
                severity: warden_core::Severity::Critical,
                rule_id: Some("instruction_override".to_string()),
                sanitized_content: None,
                reason: Some("instruction_override".to_string()),
            }
        }
        fn check_tool(&self, _: &str, _: &BTreeMap<String, serde_json::Value>, _: &BTreeMap<String, serde_json::Value>) -> warden_core::SecurityResult {
            warden_core::SecurityResult::allow()
        }
        fn check_output(&self, _: &str, _: &BTreeMap<String, serde_json::Value>) -> warden_core::SecurityResult {
            warden_core::SecurityResult::allow()
        }
    }

    #[tokio::test]
    async fn blocked_input_reacts_when_message_id_present() {
        let mw = InputSecurityMiddleware::new(Arc::new(BlockingSecurity), None, "\u{1F602}".to_string());
        let mut ctx = PipelineContext::new(sample_event());
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(matches!(&ctx.intents[1], Intent::SendReaction { emoji, .. } if emoji == "\u{1F602}"));
    }

    #[tokio::test]
    async fn blocked_input_without_message_id_sends_text() {
        let mw = InputSecurityMiddleware::new(Arc::new(BlockingSecurity), None, "\u{1F602}".to_string());
        let mut event = sample_event();
        event.message_id = None;
        let mut ctx = PipelineContext::new(event);
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(matches!(&ctx.intents[1], Intent::SendOutbound { event } if event.content == "\u{1F602}"));
    }
}
