//! Stages 7B and 9: halt the pipeline for policy-denied or silent messages,
//! with optional background notes capture shared between both middleware.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use warden_core::{Intent, SecurityAction, SecurityPort};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

fn enqueue_notes(ctx: &mut PipelineContext, security: &Arc<dyn SecurityPort>, allow_when_blocked: Option<bool>) {
    let Some(decision) = ctx.decision.clone() else { return };
    if !decision.notes_enabled {
        return;
    }
    if let Some(allowed) = allow_when_blocked {
        if !allowed {
            ctx.metric_with("memory_notes_dropped_policy", 1, vec![("channel".to_string(), ctx.event.channel.clone())]);
            return;
        }
    }

    let mut context = BTreeMap::new();
    context.insert("channel".to_string(), serde_json::json!(ctx.event.channel));
    context.insert("chat_id".to_string(), serde_json::json!(ctx.event.chat_id));
    context.insert("sender_id".to_string(), serde_json::json!(ctx.event.sender_id));
    context.insert("message_id".to_string(), serde_json::json!(ctx.event.message_id.clone().unwrap_or_default()));
    context.insert("path".to_string(), serde_json::json!("memory_notes_background"));

    let result = security.check_input(&ctx.event.content, &context);
    if result.action == SecurityAction::Block {
        ctx.metric_with(
            "security_input_blocked",
            1,
            vec![
                ("channel".to_string(), ctx.event.channel.clone()),
                ("reason".to_string(), result.reason.clone().unwrap_or_default()),
            ],
        );
        ctx.metric_with("memory_notes_dropped_security", 1, vec![("channel".to_string(), ctx.event.channel.clone())]);
        return;
    }

    let notes_mode = decision.notes_mode.unwrap_or(warden_core::NotesMode::Adaptive);
    ctx.intents.push(Intent::QueueMemoryNotesCapture {
        channel: ctx.event.channel.clone(),
        chat_id: ctx.event.chat_id.clone(),
        sender_id: ctx.event.sender_id.clone(),
        message_id: ctx.event.message_id.clone(),
        content: ctx.event.content.clone(),
        is_group: ctx.event.is_group,
        mode: notes_mode,
        batch_interval_seconds: decision.notes_batch_interval_seconds,
        batch_max_messages: decision.notes_batch_max_messages,
    });
    ctx.metric_with("memory_notes_enqueued", 1, vec![("channel".to_string(), ctx.event.channel.clone())]);
}

/// Stage 7B: halt when policy rejected the message outright.
pub struct AccessControlMiddleware {
    security: Arc<dyn SecurityPort>,
}

impl AccessControlMiddleware {
    pub fn new(security: Arc<dyn SecurityPort>) -> Self {
        Self { security }
    }
}

#[async_trait]
impl Middleware for AccessControlMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let Some(decision) = ctx.decision.clone() else {
            next.run(ctx).await;
            return;
        };

        if !decision.accept_message {
            enqueue_notes(ctx, &self.security, Some(decision.notes_allow_blocked_senders));
            ctx.metric_with(
                "policy_drop_access",
                1,
                vec![
                    ("channel".to_string(), ctx.event.channel.clone()),
                    ("reason".to_string(), decision.reason.clone().unwrap_or_default()),
                ],
            );
            ctx.halt();
            return;
        }

        next.run(ctx).await;
    }
}

/// Stage 9: halt accepted-but-silent messages after `should_respond == false`.
pub struct NoReplyFilterMiddleware {
    security: Arc<dyn SecurityPort>,
}

impl NoReplyFilterMiddleware {
    pub fn new(security: Arc<dyn SecurityPort>) -> Self {
        Self { security }
    }
}

#[async_trait]
impl Middleware for NoReplyFilterMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let Some(decision) = ctx.decision.clone() else {
            next.run(ctx).await;
            return;
        };
        if decision.should_respond {
            next.run(ctx).await;
            return;
        }

        enqueue_notes(ctx, &self.security, None);
        ctx.metric_with(
            "policy_drop_reply",
            1,
            vec![
                ("channel".to_string(), ctx.event.channel.clone()),
                ("reason".to_string(), decision.reason.clone().unwrap_or_default()),
            ],
        );
        ctx.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_event, ScriptedSecurity};
    use warden_core::PolicyDecision;

    #[tokio::test]
    async fn denied_message_halts_with_metric() {
        let mw = AccessControlMiddleware::new(Arc::new(ScriptedSecurity::default()));
        let mut ctx = PipelineContext::new(sample_event());
        ctx.decision = Some(PolicyDecision::deny("blocked_sender"));

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(matches!(&ctx.intents[0], Intent::RecordMetric { name, .. } if name == "policy_drop_access"));
    }

    #[tokio::test]
    async fn accepted_message_passes_through() {
        let mw = AccessControlMiddleware::new(Arc::new(ScriptedSecurity::default()));
        let mut ctx = PipelineContext::new(sample_event());
        ctx.decision = Some(crate::test_support::accepted_decision());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(!ctx.halted);
    }

    #[tokio::test]
    async fn silent_message_halts_in_no_reply_filter() {
        let mw = NoReplyFilterMiddleware::new(Arc::new(ScriptedSecurity::default()));
        let mut ctx = PipelineContext::new(sample_event());
        let mut decision = crate::test_support::accepted_decision();
        decision.should_respond = false;
        decision.reason = Some("when_to_reply:off".to_string());
        ctx.decision = Some(decision);

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(matches!(&ctx.intents[0], Intent::RecordMetric { name, .. } if name == "policy_drop_reply"));
    }
}
