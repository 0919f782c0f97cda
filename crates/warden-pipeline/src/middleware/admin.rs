//! Stage 5: intercept `/policy ...` commands before policy evaluation.
//!
//! Only DM callers can issue admin commands; owner status is checked
//! directly against the policy engine's owner index since full policy
//! evaluation hasn't run yet at this point in the chain.

use std::sync::Arc;

use async_trait::async_trait;
use warden_core::{Intent, OutboundEvent};
use warden_policy::{resolve_actor_identity, PolicyEngine};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};
use warden_admin::{ActorSource, PolicyActorContext, PolicyAdminService, PolicyOutcome};

pub struct AdminCommandMiddleware {
    service: Arc<PolicyAdminService>,
    policy: Arc<arc_swap::ArcSwap<PolicyEngine>>,
}

impl AdminCommandMiddleware {
    pub fn new(service: Arc<PolicyAdminService>, policy: Arc<arc_swap::ArcSwap<PolicyEngine>>) -> Self {
        Self { service, policy }
    }
}

#[async_trait]
impl Middleware for AdminCommandMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let content = ctx.event.content.trim();
        if !content.starts_with("/policy") {
            next.run(ctx).await;
            return;
        }

        let identity = resolve_actor_identity(&ctx.event.channel, &ctx.event.sender_id, &ctx.event.raw_metadata);
        let is_owner = self.policy.load().is_owner(&ctx.event.channel, &identity.primary, &identity.aliases);

        let actor = PolicyActorContext {
            source: ActorSource::Dm,
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            sender_id: identity.primary.clone(),
            is_group: ctx.event.is_group,
            is_owner,
        };

        let result = self.service.execute_from_text(content, &actor, None).await;

        let metric_name = match result.outcome {
            PolicyOutcome::Denied => "admin_command_denied_or_ignored",
            _ if result.unknown_command => "admin_command_unknown",
            _ => "admin_command_handled",
        };
        ctx.metric_with(metric_name, 1, vec![
            ("channel".to_string(), ctx.event.channel.clone()),
            ("command".to_string(), result.command_name.clone()),
        ]);
        ctx.metric_with("policy_admin_command", 1, vec![("channel".to_string(), ctx.event.channel.clone())]);

        if !result.message.is_empty() {
            ctx.intents.push(Intent::SendOutbound {
                event: OutboundEvent::text(ctx.event.channel.clone(), ctx.event.chat_id.clone(), result.message),
            });
        }
        ctx.halt();
    }
}
