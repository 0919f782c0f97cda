//! Stage 6: evaluate the event against the policy engine and store the
//! resulting decision in `ctx.decision`. Never halts.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use warden_policy::{resolve_actor_identity, ActorContext, PolicyEngine};

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

pub struct PolicyMiddleware {
    policy: Arc<ArcSwap<PolicyEngine>>,
    all_tools: HashSet<String>,
}

impl PolicyMiddleware {
    pub fn new(policy: Arc<ArcSwap<PolicyEngine>>, all_tools: HashSet<String>) -> Self {
        Self { policy, all_tools }
    }
}

#[async_trait]
impl Middleware for PolicyMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let identity = resolve_actor_identity(&ctx.event.channel, &ctx.event.sender_id, &ctx.event.raw_metadata);
        let actor = ActorContext {
            channel: ctx.event.channel.clone(),
            chat_id: ctx.event.chat_id.clone(),
            sender_primary: identity.primary,
            sender_aliases: identity.aliases,
            is_group: ctx.event.is_group,
            mentioned_bot: ctx.event.mentioned_bot,
            reply_to_bot: ctx.event.reply_to_bot,
            content: ctx.event.content.clone(),
            is_voice: ctx.event.is_voice(),
        };

        let decision = self.policy.load().evaluate(&actor, &self.all_tools);
        ctx.decision = Some(decision);
        next.run(ctx).await;
    }
}
