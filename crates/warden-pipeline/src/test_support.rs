//! Shared fixtures for middleware unit tests. Not part of the public API.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use warden_core::{
    ArchivedMessage, InboundEvent, PolicyDecision, ReplyArchivePort, Result, ResponderPort,
    SecurityAction, SecurityPort, SecurityResult, SecurityStage, Severity,
};

pub fn sample_event() -> InboundEvent {
    InboundEvent {
        channel: "telegram".to_string(),
        chat_id: "c1".to_string(),
        sender_id: "s1".to_string(),
        content: "hi".to_string(),
        message_id: Some("m1".to_string()),
        timestamp: Utc::now(),
        participant: None,
        is_group: false,
        mentioned_bot: false,
        reply_to_bot: false,
        reply_to_message_id: None,
        reply_to_participant: None,
        reply_to_text: None,
        media: Vec::new(),
        raw_metadata: BTreeMap::new(),
    }
}

pub fn accepted_decision() -> PolicyDecision {
    let mut decision = PolicyDecision::allow_all("test");
    decision.accept_message = true;
    decision.should_respond = true;
    decision
}

#[derive(Default)]
pub struct InMemoryArchive {
    pub rows: Mutex<Vec<ArchivedMessage>>,
}

#[async_trait]
impl ReplyArchivePort for InMemoryArchive {
    async fn record_inbound(&self, message: &ArchivedMessage) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let exists = rows
            .iter()
            .any(|r| r.channel == message.channel && r.chat_id == message.chat_id && r.message_id == message.message_id);
        if !exists {
            rows.push(message.clone());
        }
        Ok(())
    }

    async fn lookup_message(
        &self,
        channel: &str,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<ArchivedMessage>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|r| r.channel == channel && r.chat_id == chat_id && r.message_id == message_id)
            .cloned())
    }

    async fn lookup_message_any_chat(
        &self,
        channel: &str,
        message_id: &str,
        preferred_chat_id: Option<&str>,
    ) -> Result<Option<ArchivedMessage>> {
        let rows = self.rows.lock().unwrap();
        if let Some(preferred) = preferred_chat_id {
            if let Some(row) = rows
                .iter()
                .find(|r| r.channel == channel && r.chat_id == preferred && r.message_id == message_id)
            {
                return Ok(Some(row.clone()));
            }
        }
        Ok(rows
            .iter()
            .find(|r| r.channel == channel && r.message_id == message_id)
            .cloned())
    }

    async fn lookup_messages_before(
        &self,
        channel: &str,
        chat_id: &str,
        before: chrono::DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ArchivedMessage>> {
        let rows = self.rows.lock().unwrap();
        let mut matched: Vec<ArchivedMessage> = rows
            .iter()
            .filter(|r| r.channel == channel && r.chat_id == chat_id && r.timestamp < before)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(limit);
        Ok(matched)
    }
}

/// Security stub blocking/sanitizing on simple substring triggers so tests
/// don't need to depend on `warden-security`'s real rule set.
pub struct ScriptedSecurity {
    pub block_trigger: Option<&'static str>,
    pub sanitize_to: Option<(&'static str, &'static str)>,
}

impl Default for ScriptedSecurity {
    fn default() -> Self {
        Self { block_trigger: None, sanitize_to: None }
    }
}

impl SecurityPort for ScriptedSecurity {
    fn check_input(&self, event_text: &str, _context: &BTreeMap<String, serde_json::Value>) -> SecurityResult {
        if let Some(trigger) = self.block_trigger {
            if event_text.contains(trigger) {
                return SecurityResult {
                    stage: SecurityStage::Input,
                    action: SecurityAction::Block,
                    severity: Severity::Critical,
                    rule_id: Some("test_block".to_string()),
                    sanitized_content: None,
                    reason: Some("scripted_block".to_string()),
                };
            }
        }
        SecurityResult::allow()
    }

    fn check_tool(
        &self,
        _tool_name: &str,
        _args: &BTreeMap<String, serde_json::Value>,
        _context: &BTreeMap<String, serde_json::Value>,
    ) -> SecurityResult {
        SecurityResult::allow()
    }

    fn check_output(&self, text: &str, _context: &BTreeMap<String, serde_json::Value>) -> SecurityResult {
        if let Some((trigger, replacement)) = self.sanitize_to {
            if text.contains(trigger) {
                return SecurityResult {
                    stage: SecurityStage::Output,
                    action: SecurityAction::Sanitize,
                    severity: Severity::High,
                    rule_id: Some("test_sanitize".to_string()),
                    sanitized_content: Some(text.replace(trigger, replacement)),
                    reason: Some("scripted_sanitize".to_string()),
                };
            }
        }
        SecurityResult::allow()
    }
}

pub struct StubResponder {
    pub reply: Option<String>,
}

#[async_trait]
impl ResponderPort for StubResponder {
    async fn generate_reply(&self, _event: &InboundEvent, _decision: &PolicyDecision) -> Result<Option<String>> {
        Ok(self.reply.clone())
    }
}
