//! Stages 13-17: reaction-marker detection, output security, voice-reply
//! synthesis, threading decision, and final outbound + session-persist
//! intent assembly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;
use warden_core::{Intent, ModelRouterPort, OutboundEvent, ReactionMeta, SecurityAction, SecurityPort, TtsPort, VoiceOutputMode};
use warden_policy::PolicyEngine;

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

static REACTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^\s*::reaction::(.+?)\s*$").unwrap());
static REACTION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^([\s\S]+?)\n+::reaction::([^\n]+?)\s*$").unwrap());

fn strip_markdown_for_tts(text: &str) -> String {
    static CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
    static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
    static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());

    if text.is_empty() {
        return String::new();
    }
    let text = CODE_FENCE.replace_all(text, " ");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_for_voice(text: &str, max_sentences: u32, max_chars: u32) -> String {
    let cleaned: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return String::new();
    }
    let max_sentences = max_sentences.max(1) as usize;
    let max_chars = max_chars.max(1) as usize;

    let normalized = cleaned.replace('!', ".").replace('?', ".");
    let sentences: Vec<&str> = normalized.split('.').map(str::trim).filter(|s| !s.is_empty()).collect();
    let mut candidate = if !sentences.is_empty() {
        let mut joined = sentences.iter().take(max_sentences).cloned().collect::<Vec<_>>().join(". ");
        if !joined.is_empty() && !joined.ends_with(['.', '!', '?']) {
            joined.push('.');
        }
        joined
    } else {
        cleaned.clone()
    };

    if candidate.chars().count() <= max_chars {
        return candidate;
    }

    let ellipsis = "...";
    if max_chars <= ellipsis.len() {
        return candidate.chars().take(max_chars).collect::<String>().trim_end().to_string();
    }

    let keep = max_chars - ellipsis.len();
    let mut clipped: String = candidate.chars().take(keep).collect::<String>().trim_end().to_string();
    if let Some(idx) = clipped.rfind(' ') {
        clipped.truncate(idx);
        clipped = clipped.trim_end().to_string();
    }
    if clipped.is_empty() {
        clipped = candidate.chars().take(keep).collect::<String>().trim_end().to_string();
    }
    clipped = clipped.trim_end_matches([' ', '.']).to_string();
    if clipped.is_empty() {
        candidate.truncate(max_chars);
        return candidate;
    }
    format!("{clipped}{ellipsis}")
}

fn write_tts_audio_file(outgoing_dir: &std::path::Path, audio_bytes: &[u8], ext: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(outgoing_dir)?;
    let name = format!("tts-{}{ext}", Uuid::new_v4().simple());
    let path = outgoing_dir.join(name);
    std::fs::write(&path, audio_bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(path)
}

fn normalize_owner_target(channel: &str, raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if channel != "whatsapp" {
        return Some(value.to_string());
    }
    if value.contains('@') {
        return Some(value.to_string());
    }
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("{digits}@s.whatsapp.net"))
}

pub struct OutboundMiddleware {
    security: Option<Arc<dyn SecurityPort>>,
    security_block_message: String,
    tts: Option<Arc<dyn TtsPort>>,
    tts_outgoing_dir: Option<PathBuf>,
    tts_max_raw_bytes: usize,
    model_router: Option<Arc<dyn ModelRouterPort>>,
    policy: Option<Arc<ArcSwap<PolicyEngine>>>,
    owner_alert_cooldown: Duration,
    recent_alert_keys: Mutex<HashMap<String, Instant>>,
}

impl OutboundMiddleware {
    pub fn new(
        security: Option<Arc<dyn SecurityPort>>,
        security_block_message: String,
        tts: Option<Arc<dyn TtsPort>>,
        tts_outgoing_dir: Option<PathBuf>,
        tts_max_raw_bytes: usize,
        model_router: Option<Arc<dyn ModelRouterPort>>,
        policy: Option<Arc<ArcSwap<PolicyEngine>>>,
        owner_alert_cooldown_seconds: u64,
    ) -> Self {
        Self {
            security,
            security_block_message,
            tts,
            tts_outgoing_dir,
            tts_max_raw_bytes: tts_max_raw_bytes.max(1),
            model_router,
            policy,
            owner_alert_cooldown: Duration::from_secs(owner_alert_cooldown_seconds.max(30)),
            recent_alert_keys: Mutex::new(HashMap::new()),
        }
    }

    async fn append_owner_alert(&self, ctx: &mut PipelineContext, channel: &str, chat_id: &str, reason: &str) {
        let Some(policy) = &self.policy else { return };
        let targets_raw: Vec<String> = policy.load().policy().owners.get(channel).cloned().unwrap_or_default();
        if targets_raw.is_empty() {
            return;
        }

        let reason_compact = reason.split_whitespace().collect::<Vec<_>>().join(" ");
        let reason_compact = if reason_compact.is_empty() { "unknown".to_string() } else { reason_compact };
        let key = format!("{channel}:{reason_compact}");

        let mut recent = self.recent_alert_keys.lock().await;
        let now = Instant::now();
        recent.retain(|_, expires_at| *expires_at > now);
        if recent.contains_key(&key) {
            return;
        }
        recent.insert(key, now + self.owner_alert_cooldown);
        drop(recent);

        let content = format!("\u{26A0}\u{FE0F} Warden diagnostic\nvoice fallback in {channel}:{chat_id}\nreason={reason_compact}");
        let mut targets: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for raw in &targets_raw {
            if let Some(target) = normalize_owner_target(channel, raw) {
                targets.insert(target);
            }
        }
        for target in targets {
            ctx.intents.push(Intent::SendOutbound { event: OutboundEvent::text(channel, target, content.clone()) });
        }
    }

    fn resolve_tts_profile(&self, route: &str, channel: &str) -> Option<warden_core::RouteProfile> {
        let router = self.model_router.as_ref()?;
        let task_key = if route.is_empty() { "tts.speak" } else { route };
        if task_key.starts_with(&format!("{channel}.")) {
            router.resolve(task_key)
        } else {
            router.resolve(&format!("{channel}.{task_key}")).or_else(|| router.resolve(task_key))
        }
    }

    fn is_inbound_voice(event: &warden_core::InboundEvent) -> bool {
        event.is_voice()
    }

    async fn maybe_voice_reply(&self, ctx: &mut PipelineContext, reply: &str, outbound_channel: &str, outbound_chat_id: &str) -> Option<OutboundEvent> {
        let tts = self.tts.as_ref()?;
        let outgoing_dir = self.tts_outgoing_dir.as_ref()?;
        if outbound_channel != "whatsapp" {
            return None;
        }
        let decision = ctx.decision.clone()?;

        match decision.voice_output_mode {
            VoiceOutputMode::Off | VoiceOutputMode::Text => return None,
            VoiceOutputMode::InKind if !Self::is_inbound_voice(&ctx.event) => return None,
            _ => {}
        }
        if decision.voice_format != "opus" {
            return None;
        }

        let route = if decision.voice_tts_route.is_empty() { "tts.speak" } else { &decision.voice_tts_route };
        let profile = match self.resolve_tts_profile(route, outbound_channel) {
            Some(p) => p,
            None => {
                self.append_owner_alert(ctx, outbound_channel, outbound_chat_id, &format!("tts_route_unresolved:{route}")).await;
                return None;
            }
        };

        let voice = if decision.voice.is_empty() { "alloy" } else { &decision.voice };
        let plain = strip_markdown_for_tts(reply);
        let limited = truncate_for_voice(&plain, decision.voice_max_sentences, decision.voice_max_chars);
        if limited.is_empty() {
            return None;
        }

        let audio = match tts.synthesize(&limited, Some(voice), "opus").await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(error = %e, "tts_synthesize_failed");
                self.append_owner_alert(ctx, outbound_channel, outbound_chat_id, "tts_exception").await;
                return None;
            }
        };

        if audio.bytes.is_empty() {
            self.append_owner_alert(ctx, outbound_channel, outbound_chat_id, "tts_empty_audio").await;
            return None;
        }
        if audio.bytes.len() > self.tts_max_raw_bytes {
            self.append_owner_alert(
                ctx,
                outbound_channel,
                outbound_chat_id,
                &format!("tts_audio_too_large:{}>{}", audio.bytes.len(), self.tts_max_raw_bytes),
            )
            .await;
            return None;
        }

        let _ = profile;
        let out_dir = outgoing_dir.join("tts");
        match write_tts_audio_file(&out_dir, &audio.bytes, ".ogg") {
            Ok(path) => Some(OutboundEvent {
                channel: outbound_channel.to_string(),
                chat_id: outbound_chat_id.to_string(),
                content: String::new(),
                reply_to: ctx.event.message_id.clone(),
                media: vec![path.to_string_lossy().to_string()],
                reaction: None,
            }),
            Err(e) => {
                warn!(error = %e, "tts_write_failed");
                self.append_owner_alert(ctx, outbound_channel, outbound_chat_id, "tts_write_failed").await;
                None
            }
        }
    }
}

#[async_trait]
impl Middleware for OutboundMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        let Some(mut reply) = ctx.reply.clone() else { return };

        let event = ctx.event.clone();
        let decision = ctx.decision.clone();

        if let Some(caps) = REACTION_RE.captures(&reply) {
            if let Some(message_id) = event.message_id.clone() {
                let full_content = caps.get(1).unwrap().as_str().trim().to_string();
                let mut parts = full_content.splitn(2, '\n');
                let emoji = parts.next().unwrap_or_default().trim().to_string();
                let text_body = parts.next().unwrap_or_default().trim().to_string();

                ctx.intents.push(Intent::SendReaction {
                    channel: event.channel.clone(),
                    chat_id: event.chat_id.clone(),
                    message_id,
                    emoji: emoji.clone(),
                    participant: event.participant.clone(),
                });
                ctx.metric_with("reaction_sent", 1, vec![("channel".to_string(), event.channel.clone())]);

                if text_body.is_empty() {
                    ctx.intents.push(Intent::PersistSession {
                        session_key: format!("{}:{}", event.channel, event.chat_id),
                        user_content: event.content.clone(),
                        assistant_content: format!("[reacted with {emoji}]"),
                    });
                    return;
                }
                reply = text_body;
            }
        } else if let Some(caps) = REACTION_SUFFIX_RE.captures(&reply) {
            reply = caps.get(1).unwrap().as_str().trim().to_string();
        }

        if let Some(security) = &self.security {
            let mut context = std::collections::BTreeMap::new();
            context.insert("channel".to_string(), serde_json::json!(event.channel));
            context.insert("chat_id".to_string(), serde_json::json!(event.chat_id));
            context.insert("sender_id".to_string(), serde_json::json!(event.sender_id));
            context.insert("message_id".to_string(), serde_json::json!(event.message_id.clone().unwrap_or_default()));

            let result = security.check_output(&reply, &context);
            match result.action {
                SecurityAction::Sanitize => {
                    reply = result.sanitized_content.clone().unwrap_or_else(|| self.security_block_message.clone());
                    ctx.metric_with("security_output_sanitized", 1, vec![("channel".to_string(), event.channel.clone())]);
                }
                SecurityAction::Block => {
                    reply = result.sanitized_content.clone().unwrap_or_else(|| self.security_block_message.clone());
                    ctx.metric_with(
                        "security_output_blocked",
                        1,
                        vec![
                            ("channel".to_string(), event.channel.clone()),
                            ("reason".to_string(), result.reason.clone().unwrap_or_default()),
                        ],
                    );
                }
                SecurityAction::Allow => {}
            }
        }

        let (outbound_channel, outbound_chat_id) = if event.channel == "system" {
            match event.chat_id.split_once(':') {
                Some((route_channel, route_chat_id)) if !route_channel.is_empty() && !route_chat_id.is_empty() => {
                    (route_channel.to_string(), route_chat_id.to_string())
                }
                _ => {
                    warn!(chat_id = %event.chat_id, "system_route_unresolved, dropping reply");
                    ctx.metric("system_route_unresolved");
                    ctx.halt();
                    return;
                }
            }
        } else {
            (event.channel.clone(), event.chat_id.clone())
        };

        let should_thread = decision.as_ref().is_some_and(|d| {
            outbound_channel == "whatsapp"
                && event.is_group
                && event.message_id.is_some()
                && d.when_to_reply_mode == warden_core::WhenToReplyMode::MentionOnly
                && (event.mentioned_bot || event.reply_to_bot)
        });

        let mut outbound = OutboundEvent {
            channel: outbound_channel.clone(),
            chat_id: outbound_chat_id.clone(),
            content: reply.clone(),
            reply_to: if should_thread { event.message_id.clone() } else { None },
            media: Vec::new(),
            reaction: None,
        };

        if let Some(voice_outbound) = self.maybe_voice_reply(ctx, &reply, &outbound_channel, &outbound_chat_id).await {
            outbound = voice_outbound;
        }

        ctx.intents.push(Intent::SendOutbound { event: outbound });
        ctx.intents.push(Intent::PersistSession {
            session_key: format!("{}:{}", event.channel, event.chat_id),
            user_content: event.content.clone(),
            assistant_content: reply,
        });
        ctx.metric_with("response_sent", 1, vec![("channel".to_string(), event.channel.clone())]);

        next.run(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{accepted_decision, sample_event};

    #[tokio::test]
    async fn reaction_marker_emits_reaction_and_persist_when_no_body() {
        let mw = OutboundMiddleware::new(None, "\u{1F602}".to_string(), None, None, 160 * 1024, None, None, 300);
        let mut ctx = PipelineContext::new(sample_event());
        ctx.decision = Some(accepted_decision());
        ctx.reply = Some("::reaction::\u{1F44D}".to_string());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(matches!(&ctx.intents[0], Intent::SendReaction { emoji, .. } if emoji == "\u{1F44D}"));
        assert!(matches!(&ctx.intents[2], Intent::PersistSession { .. }));
    }

    #[tokio::test]
    async fn plain_reply_assembles_outbound_and_persist() {
        let mw = OutboundMiddleware::new(None, "\u{1F602}".to_string(), None, None, 160 * 1024, None, None, 300);
        let mut ctx = PipelineContext::new(sample_event());
        ctx.decision = Some(accepted_decision());
        ctx.reply = Some("hello there".to_string());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(matches!(&ctx.intents[0], Intent::SendOutbound { event } if event.content == "hello there"));
        assert!(matches!(&ctx.intents[1], Intent::PersistSession { assistant_content, .. } if assistant_content == "hello there"));
    }

    #[tokio::test]
    async fn system_channel_reroutes_to_embedded_target() {
        let mw = OutboundMiddleware::new(None, "\u{1F602}".to_string(), None, None, 160 * 1024, None, None, 300);
        let mut event = sample_event();
        event.channel = "system".to_string();
        event.chat_id = "telegram:c9".to_string();
        let mut ctx = PipelineContext::new(event);
        ctx.decision = Some(accepted_decision());
        ctx.reply = Some("heartbeat".to_string());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(matches!(&ctx.intents[0], Intent::SendOutbound { event } if event.channel == "telegram" && event.chat_id == "c9"));
    }

    #[tokio::test]
    async fn system_channel_with_unroutable_chat_id_drops_and_records_metric() {
        let mw = OutboundMiddleware::new(None, "\u{1F602}".to_string(), None, None, 160 * 1024, None, None, 300);
        let mut event = sample_event();
        event.channel = "system".to_string();
        event.chat_id = "heartbeat".to_string();
        let mut ctx = PipelineContext::new(event);
        ctx.decision = Some(accepted_decision());
        ctx.reply = Some("heartbeat".to_string());

        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        crate::runner::Pipeline::new(layers).run(&mut ctx).await;

        assert!(ctx.halted);
        assert!(ctx.intents.iter().all(|i| !matches!(i, Intent::SendOutbound { .. })));
        assert!(matches!(&ctx.intents[0], Intent::RecordMetric { name, .. } if name == "system_route_unresolved"));
    }
}
