//! Stage 8 (WhatsApp-only): notify the owner the first time the bot sees a
//! new WhatsApp chat, with quick-approval slash-command hints.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use warden_core::{GroupDirectoryPort, Intent, OutboundEvent};
use warden_policy::PolicyEngine;

use crate::context::PipelineContext;
use crate::runner::{Middleware, Next};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SeenChatsFile {
    #[serde(default)]
    chats: BTreeSet<String>,
}

pub struct NewChatNotifyMiddleware {
    policy: Arc<ArcSwap<PolicyEngine>>,
    group_directory: Option<Arc<dyn GroupDirectoryPort>>,
    seen_chats_path: PathBuf,
    notified: Mutex<BTreeSet<String>>,
}

impl NewChatNotifyMiddleware {
    pub fn new(
        policy: Arc<ArcSwap<PolicyEngine>>,
        group_directory: Option<Arc<dyn GroupDirectoryPort>>,
        seen_chats_path: PathBuf,
    ) -> Self {
        Self {
            policy,
            group_directory,
            seen_chats_path,
            notified: Mutex::new(BTreeSet::new()),
        }
    }

    fn load_seen_chats(&self) -> BTreeSet<String> {
        std::fs::read_to_string(&self.seen_chats_path)
            .ok()
            .and_then(|text| serde_json::from_str::<SeenChatsFile>(&text).ok())
            .map(|f| f.chats)
            .unwrap_or_default()
    }

    fn save_seen_chats(&self, chats: &BTreeSet<String>) {
        if let Some(parent) = self.seen_chats_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "new_chat_seen_dir_create_failed");
                return;
            }
        }
        let payload = SeenChatsFile { chats: chats.clone() };
        match serde_json::to_string(&payload) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.seen_chats_path, text) {
                    warn!(error = %e, "new_chat_seen_write_failed");
                }
            }
            Err(e) => warn!(error = %e, "new_chat_seen_serialize_failed"),
        }
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

    async fn maybe_notify(&self, ctx: &mut PipelineContext) {
        let event = ctx.event.clone();
        let owners: Vec<String> = self
            .policy
            .load()
            .policy()
            .owners
            .get(&event.channel)
            .cloned()
            .unwrap_or_default();
        if owners.is_empty() {
            return;
        }

        let full_key = format!("{}:{}", event.channel, event.chat_id);
        {
            let notified = self.notified.lock().await;
            if notified.contains(&full_key) {
                return;
            }
        }

        let mut seen_chats = self.load_seen_chats();
        if seen_chats.contains(&full_key) {
            self.notified.lock().await.insert(full_key);
            return;
        }

        self.notified.lock().await.insert(full_key.clone());
        seen_chats.insert(full_key);
        self.save_seen_chats(&seen_chats);

        let group_subject = match &self.group_directory {
            Some(directory) => directory.subject_for(&event.chat_id).await,
            None => None,
        };
        let group_name = group_subject.or_else(|| {
            event
                .raw_metadata
                .get("group_name")
                .or_else(|| event.raw_metadata.get("subject"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        let group_desc = event
            .raw_metadata
            .get("group_desc")
            .or_else(|| event.raw_metadata.get("description"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let is_group = event.chat_id.ends_with("@g.us");
        let chat_type = if is_group { "group" } else { "chat" };

        let mut lines = vec![format!("\u{1F514} Warden was added to a new WhatsApp {chat_type}")];
        if let Some(name) = &group_name {
            lines.push(format!("\u{1F4DB} Name: {name}"));
        }
        if let Some(desc) = &group_desc {
            lines.push(format!("\u{1F4DD} Description: {desc}"));
        }
        lines.push(format!("\u{1F194} ID: `{}`", event.chat_id));
        lines.push(String::new());
        lines.push("\u{26A1} Quick commands:".to_string());
        lines.push(format!("  /approve {}  \u{2192} allow + reply all", event.chat_id));
        lines.push(format!("  /approve-mention {}  \u{2192} allow + mention only", event.chat_id));
        lines.push(format!("  /deny {}  \u{2192} block", event.chat_id));
        lines.push(String::new());
        lines.push("Or use full commands:".to_string());
        lines.push(format!("  /policy allow-group {}", event.chat_id));
        lines.push(format!("  /policy set-when {} all|mention_only", event.chat_id));
        lines.push(format!("  /policy block-group {}", event.chat_id));
        let message = lines.join("\n");

        let mut targets: BTreeSet<String> = BTreeSet::new();
        for raw in &owners {
            if let Some(target) = Self::normalize_owner_target(&event.channel, raw) {
                targets.insert(target);
            }
        }

        for target in targets {
            ctx.intents.push(Intent::SendOutbound {
                event: OutboundEvent::text(event.channel.clone(), target, message.clone()),
            });
        }
    }
}

#[async_trait]
impl Middleware for NewChatNotifyMiddleware {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) {
        if ctx.event.channel == "whatsapp" {
            self.maybe_notify(ctx).await;
        }
        next.run(ctx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_event;
    use warden_policy::PolicyConfig;

    fn policy_with_owner() -> Arc<ArcSwap<PolicyEngine>> {
        let mut config = PolicyConfig::default();
        config.owners.insert("whatsapp".to_string(), vec!["5511999@s.whatsapp.net".to_string()]);
        Arc::new(ArcSwap::from_pointee(PolicyEngine::new(config, PathBuf::from("/tmp"), None)))
    }

    #[tokio::test]
    async fn first_sighting_notifies_owner_once() {
        let dir = tempfile::tempdir().unwrap();
        let seen_path = dir.path().join("seen_chats.json");
        let mw = NewChatNotifyMiddleware::new(policy_with_owner(), None, seen_path);

        let mut event = sample_event();
        event.channel = "whatsapp".to_string();
        event.chat_id = "123@g.us".to_string();
        let mut ctx = PipelineContext::new(event.clone());
        let layers: Vec<Arc<dyn Middleware>> = vec![Arc::new(mw)];
        let pipeline = crate::runner::Pipeline::new(layers);
        pipeline.run(&mut ctx).await;
        assert_eq!(ctx.intents.len(), 1);

        let mut ctx2 = PipelineContext::new(event);
        pipeline.run(&mut ctx2).await;
        assert!(ctx2.intents.is_empty());
    }
}
