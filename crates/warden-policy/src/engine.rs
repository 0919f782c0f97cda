//! Policy compilation and evaluation.
//!
//! Three-level override resolution (`defaults` -> channel `default` -> chat
//! override), deep-merged with list-replace semantics and compiled into a
//! frozen, cheaply-clonable [`CompiledPolicy`] cached per `(channel,
//! chat_id)`. [`PolicyEngine::evaluate`] is the hot path every inbound event
//! runs through; [`PolicyEngine::validate`] runs once per load/reload.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use dashmap::DashMap;
use warden_core::{
    AllowedToolsMode, NotesMode, PolicyDecision, Result, ToolAccessMode, VoiceOutputMode,
    WardenError, WhenToReplyMode, WhoCanTalkMode,
};

use crate::identity::normalize_identity_token;
use crate::persona::resolve_persona_path;
use crate::schema::{
    AllowedToolsPolicy, ChatPolicy, ChatPolicyOverride, PolicyConfig, ToolAccessRule,
};

fn normalize_sender_set(channel: &str, values: &[String]) -> HashSet<String> {
    crate::identity::normalize_sender_list(channel, values)
}

fn normalize_tool_names(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn normalize_wake_text(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn wake_phrase_match(content: &str, phrases: &[String]) -> bool {
    let normalized = normalize_wake_text(content);
    let padded = format!(" {normalized} ");
    phrases.iter().any(|phrase| {
        let np = normalize_wake_text(phrase);
        !np.is_empty() && padded.contains(&format!(" {np} "))
    })
}

/// The actor half of a policy evaluation: who sent this, and what do we
/// already know about the message shape.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub channel: String,
    pub chat_id: String,
    pub sender_primary: String,
    pub sender_aliases: Vec<String>,
    pub is_group: bool,
    pub mentioned_bot: bool,
    pub reply_to_bot: bool,
    pub content: String,
    pub is_voice: bool,
}

#[derive(Debug, Clone)]
struct CompiledToolAccessRule {
    mode: ToolAccessMode,
    senders: HashSet<String>,
}

/// Frozen, per-(channel[,chat]) compiled policy. Cheap to clone: every field
/// is either `Copy` or a small collection produced once at compile time.
#[derive(Debug, Clone)]
struct CompiledPolicy {
    who_can_talk_mode: WhoCanTalkMode,
    who_can_talk_senders: HashSet<String>,
    when_to_reply_mode: WhenToReplyMode,
    when_to_reply_senders: HashSet<String>,
    blocked_senders: HashSet<String>,
    allowed_tools_mode: AllowedToolsMode,
    allowed_tools_tools: HashSet<String>,
    allowed_tools_deny: HashSet<String>,
    tool_access: HashMap<String, CompiledToolAccessRule>,
    persona_file: Option<String>,
    voice_input_wake_phrases: Vec<String>,
    voice_output_mode: VoiceOutputMode,
    voice_tts_route: String,
    voice: String,
    voice_format: String,
    voice_max_sentences: u32,
    voice_max_chars: u32,
}

#[derive(Debug, Clone)]
struct CompiledMemoryNotesSettings {
    enabled: Option<bool>,
    mode: Option<NotesMode>,
    allow_blocked_senders: Option<bool>,
}

/// Resolved memory-notes decision for one chat.
#[derive(Debug, Clone)]
pub struct MemoryNotesDecision {
    pub enabled: bool,
    pub mode: NotesMode,
    pub allow_blocked_senders: bool,
    pub batch_interval_seconds: u64,
    pub batch_max_messages: u32,
}

/// Human-readable resolved policy for one chat, used by the `status-group`
/// and `explain-group` admin commands.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EffectivePolicy {
    pub channel: String,
    pub chat_id: String,
    pub source_layer: String,
    pub who_can_talk_mode: WhoCanTalkMode,
    pub who_can_talk_senders: Vec<String>,
    pub when_to_reply_mode: WhenToReplyMode,
    pub when_to_reply_senders: Vec<String>,
    pub blocked_senders: Vec<String>,
    pub allowed_tools_mode: AllowedToolsMode,
    pub allowed_tools_tools: Vec<String>,
    pub allowed_tools_deny: Vec<String>,
    pub persona_file: Option<String>,
}

/// Merges `defaults`-shaped chat policy with an optional override, applying
/// list-replace (not list-concat) semantics field by field.
fn apply_override(base: &ChatPolicy, over: &ChatPolicyOverride) -> ChatPolicy {
    let mut merged = base.clone();

    if let Some(o) = &over.who_can_talk {
        if let Some(mode) = o.mode {
            merged.who_can_talk.mode = mode;
        }
        if let Some(senders) = &o.senders {
            merged.who_can_talk.senders = senders.clone();
        }
    }
    if let Some(o) = &over.when_to_reply {
        if let Some(mode) = o.mode {
            merged.when_to_reply.mode = mode;
        }
        if let Some(senders) = &o.senders {
            merged.when_to_reply.senders = senders.clone();
        }
    }
    if let Some(o) = &over.blocked_senders {
        if let Some(senders) = &o.senders {
            merged.blocked_senders.senders = senders.clone();
        }
    }
    if let Some(o) = &over.allowed_tools {
        if let Some(mode) = o.mode {
            merged.allowed_tools.mode = mode;
        }
        if let Some(tools) = &o.tools {
            merged.allowed_tools.tools = tools.clone();
        }
        if let Some(deny) = &o.deny {
            merged.allowed_tools.deny = deny.clone();
        }
    }
    if let Some(o) = &over.tool_access {
        // tool_access merges key-by-key: an override may add or replace a
        // single tool's rule without clearing the rest.
        for (tool, rule_over) in o {
            let entry = merged
                .tool_access
                .entry(tool.clone())
                .or_insert_with(ToolAccessRule::default);
            if let Some(mode) = rule_over.mode {
                entry.mode = mode;
            }
            if let Some(senders) = &rule_over.senders {
                entry.senders = senders.clone();
            }
        }
    }
    if let Some(persona) = &over.persona_file {
        merged.persona_file = Some(persona.clone());
    }
    if let Some(o) = &over.voice {
        if let Some(input) = &o.input {
            if let Some(phrases) = &input.wake_phrases {
                merged.voice.input.wake_phrases = phrases.clone();
            }
        }
        if let Some(output) = &o.output {
            if let Some(mode) = output.mode {
                merged.voice.output.mode = mode;
            }
            if let Some(route) = &output.tts_route {
                merged.voice.output.tts_route = route.clone();
            }
            if let Some(voice) = &output.voice {
                merged.voice.output.voice = voice.clone();
            }
            if let Some(format) = &output.format {
                merged.voice.output.format = format.clone();
            }
            if let Some(max_sentences) = output.max_sentences {
                merged.voice.output.max_sentences = max_sentences;
            }
            if let Some(max_chars) = output.max_chars {
                merged.voice.output.max_chars = max_chars;
            }
        }
    }
    merged
}

fn compile_chat_policy(channel: &str, resolved: &ChatPolicy) -> CompiledPolicy {
    let tool_access = resolved
        .tool_access
        .iter()
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, rule)| {
            (
                name.trim().to_string(),
                CompiledToolAccessRule {
                    mode: rule.mode,
                    senders: normalize_sender_set(channel, &rule.senders),
                },
            )
        })
        .collect();

    CompiledPolicy {
        who_can_talk_mode: resolved.who_can_talk.mode,
        who_can_talk_senders: normalize_sender_set(channel, &resolved.who_can_talk.senders),
        when_to_reply_mode: resolved.when_to_reply.mode,
        when_to_reply_senders: normalize_sender_set(channel, &resolved.when_to_reply.senders),
        blocked_senders: normalize_sender_set(channel, &resolved.blocked_senders.senders),
        allowed_tools_mode: resolved.allowed_tools.mode,
        allowed_tools_tools: normalize_tool_names(&resolved.allowed_tools.tools),
        allowed_tools_deny: normalize_tool_names(&resolved.allowed_tools.deny),
        tool_access,
        persona_file: resolved.persona_file.clone(),
        voice_input_wake_phrases: resolved.voice.input.wake_phrases.clone(),
        voice_output_mode: resolved.voice.output.mode,
        voice_tts_route: resolved.voice.output.tts_route.clone(),
        voice: resolved.voice.output.voice.clone(),
        voice_format: resolved.voice.output.format.clone(),
        voice_max_sentences: resolved.voice.output.max_sentences,
        voice_max_chars: resolved.voice.output.max_chars,
    }
}

/// Hot-reloadable, compiled policy document plus evaluation logic.
///
/// One instance is shared (behind an `Arc`) across the pipeline; `recompile`
/// swaps in a freshly-loaded document when the orchestrator's reload poll
/// notices `policy.json` changed on disk.
pub struct PolicyEngine {
    policy: PolicyConfig,
    workspace: PathBuf,
    apply_channels: HashSet<String>,
    owner_index: HashMap<String, HashSet<String>>,
    channel_defaults: HashMap<String, CompiledPolicy>,
    chat_rules: HashMap<(String, String), CompiledPolicy>,
    memory_notes_defaults: HashMap<String, CompiledMemoryNotesSettings>,
    memory_notes_chat: HashMap<(String, String), CompiledMemoryNotesSettings>,
    resolved_cache: DashMap<(String, String), CompiledPolicyHandle>,
}

type CompiledPolicyHandle = std::sync::Arc<CompiledPolicy>;

impl PolicyEngine {
    pub fn new(policy: PolicyConfig, workspace: PathBuf, apply_channels: Option<Vec<String>>) -> Self {
        let apply_channels: HashSet<String> = apply_channels
            .unwrap_or_else(|| vec!["telegram".to_string(), "whatsapp".to_string()])
            .into_iter()
            .collect();

        let mut engine = Self {
            policy,
            workspace,
            apply_channels,
            owner_index: HashMap::new(),
            channel_defaults: HashMap::new(),
            chat_rules: HashMap::new(),
            memory_notes_defaults: HashMap::new(),
            memory_notes_chat: HashMap::new(),
            resolved_cache: DashMap::new(),
        };
        engine.compile();
        engine
    }

    /// Swaps in a freshly-loaded policy document and recompiles.
    pub fn recompile(&mut self, policy: PolicyConfig) {
        self.policy = policy;
        self.compile();
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    fn compile(&mut self) {
        self.owner_index.clear();
        self.channel_defaults.clear();
        self.chat_rules.clear();
        self.resolved_cache.clear();

        for (channel, owners) in &self.policy.owners {
            self.owner_index
                .insert(channel.clone(), normalize_sender_set(channel, owners));
        }

        let mut channels_to_compile: HashSet<String> = self.apply_channels.clone();
        channels_to_compile.extend(self.policy.channels.keys().cloned());

        for channel in channels_to_compile {
            let empty_channel_policy;
            let channel_policy = match self.policy.channels.get(&channel) {
                Some(cp) => cp,
                None => {
                    empty_channel_policy = crate::schema::ChannelPolicy::default();
                    &empty_channel_policy
                }
            };
            let base = apply_override(&self.policy.defaults, &channel_policy.default);
            self.channel_defaults
                .insert(channel.clone(), compile_chat_policy(&channel, &base));

            for (chat_id, chat_override) in &channel_policy.chats {
                let chat_policy = apply_override(&base, chat_override);
                self.chat_rules.insert(
                    (channel.clone(), chat_id.clone()),
                    compile_chat_policy(&channel, &chat_policy),
                );
            }
        }

        self.compile_memory_notes();
    }

    fn compile_memory_notes(&mut self) {
        self.memory_notes_defaults.clear();
        self.memory_notes_chat.clear();

        for (channel, channel_cfg) in &self.policy.memory_notes.channels {
            self.memory_notes_defaults.insert(
                channel.clone(),
                CompiledMemoryNotesSettings {
                    enabled: channel_cfg.default.enabled,
                    mode: channel_cfg.default.mode,
                    allow_blocked_senders: channel_cfg.default.allow_blocked_senders,
                },
            );
            for (chat_id, chat_cfg) in &channel_cfg.chats {
                self.memory_notes_chat.insert(
                    (channel.clone(), chat_id.clone()),
                    CompiledMemoryNotesSettings {
                        enabled: chat_cfg.enabled,
                        mode: chat_cfg.mode,
                        allow_blocked_senders: chat_cfg.allow_blocked_senders,
                    },
                );
            }
        }
    }

    fn resolve_compiled_policy(&self, channel: &str, chat_id: &str) -> Option<CompiledPolicyHandle> {
        let key = (channel.to_string(), chat_id.to_string());
        if let Some(hit) = self.resolved_cache.get(&key) {
            return Some(hit.clone());
        }
        let compiled = self
            .chat_rules
            .get(&key)
            .or_else(|| self.channel_defaults.get(channel))?
            .clone();
        let handle = std::sync::Arc::new(compiled);
        self.resolved_cache.insert(key, handle.clone());
        Some(handle)
    }

    fn source_layer(&self, channel: &str, chat_id: &str) -> &'static str {
        if self.chat_rules.contains_key(&(channel.to_string(), chat_id.to_string())) {
            "chat"
        } else if self.channel_defaults.contains_key(channel) {
            "channel"
        } else {
            "default"
        }
    }

    fn sender_match(&self, primary: &str, aliases: &[String], allowed: &HashSet<String>) -> bool {
        let mut candidates = vec![normalize_identity_token(primary)];
        candidates.extend(aliases.iter().map(|a| normalize_identity_token(a)));
        candidates.iter().any(|c| !c.is_empty() && allowed.contains(c))
    }

    fn owner_match(&self, actor: &ActorContext) -> bool {
        match self.owner_index.get(&actor.channel) {
            Some(owners) => self.sender_match(&actor.sender_primary, &actor.sender_aliases, owners),
            None => false,
        }
    }

    /// Owner check independent of a full `evaluate` call, for surfaces that
    /// need to know "is this sender an owner" before (or without) running
    /// the rest of policy evaluation — e.g. admin-command interception,
    /// which must authorize DM callers before policy has even looked at the
    /// message.
    pub fn is_owner(&self, channel: &str, sender_primary: &str, sender_aliases: &[String]) -> bool {
        match self.owner_index.get(channel) {
            Some(owners) => self.sender_match(sender_primary, sender_aliases, owners),
            None => false,
        }
    }

    fn evaluate_who_can_talk(&self, actor: &ActorContext, compiled: &CompiledPolicy) -> (bool, String) {
        match compiled.who_can_talk_mode {
            WhoCanTalkMode::Everyone => (true, "who_can_talk:everyone".to_string()),
            WhoCanTalkMode::Allowlist => (
                self.sender_match(&actor.sender_primary, &actor.sender_aliases, &compiled.who_can_talk_senders),
                "who_can_talk:allowlist".to_string(),
            ),
            WhoCanTalkMode::OwnerOnly => (self.owner_match(actor), "who_can_talk:owner_only".to_string()),
        }
    }

    fn evaluate_when_to_reply(&self, actor: &ActorContext, compiled: &CompiledPolicy) -> (bool, String) {
        match compiled.when_to_reply_mode {
            WhenToReplyMode::All => (true, "when_to_reply:all".to_string()),
            WhenToReplyMode::Off => (false, "when_to_reply:off".to_string()),
            WhenToReplyMode::MentionOnly => {
                if !actor.is_group {
                    return (true, "when_to_reply:mention_only_dm".to_string());
                }
                if actor.mentioned_bot || actor.reply_to_bot {
                    return (true, "when_to_reply:mention_only_group".to_string());
                }
                if actor.is_voice && wake_phrase_match(&actor.content, &compiled.voice_input_wake_phrases) {
                    return (true, "when_to_reply:mention_only_group_voice_wake_phrase".to_string());
                }
                (false, "when_to_reply:mention_only_group".to_string())
            }
            WhenToReplyMode::AllowedSenders => (
                self.sender_match(&actor.sender_primary, &actor.sender_aliases, &compiled.when_to_reply_senders),
                "when_to_reply:allowed_senders".to_string(),
            ),
            WhenToReplyMode::OwnerOnly => (self.owner_match(actor), "when_to_reply:owner_only".to_string()),
        }
    }

    fn is_tool_allowed_for_actor(&self, actor: &ActorContext, tool_name: &str, compiled: &CompiledPolicy) -> bool {
        match compiled.tool_access.get(tool_name) {
            None => true,
            Some(rule) => match rule.mode {
                ToolAccessMode::Everyone => true,
                ToolAccessMode::Allowlist => {
                    self.sender_match(&actor.sender_primary, &actor.sender_aliases, &rule.senders)
                }
                ToolAccessMode::OwnerOnly => self.owner_match(actor),
            },
        }
    }

    fn resolve_allowed_tools(&self, actor: &ActorContext, compiled: &CompiledPolicy, all_tools: &HashSet<String>) -> Vec<String> {
        let mut allowed: HashSet<String> = match compiled.allowed_tools_mode {
            AllowedToolsMode::All => all_tools.clone(),
            AllowedToolsMode::Allowlist => compiled
                .allowed_tools_tools
                .intersection(all_tools)
                .cloned()
                .collect(),
        };
        for denied in &compiled.allowed_tools_deny {
            allowed.remove(denied);
        }
        if !allowed.contains("exec") {
            allowed.remove("spawn");
        }
        let mut result: Vec<String> = allowed
            .into_iter()
            .filter(|tool| self.is_tool_allowed_for_actor(actor, tool, compiled))
            .collect();
        result.sort();
        result
    }

    fn resolve_memory_notes_compiled(&self, channel: &str, chat_id: &str, is_group: bool) -> MemoryNotesDecision {
        let notes = &self.policy.memory_notes;
        let batch_interval = notes.batch.interval_seconds;
        let batch_max = notes.batch.max_messages;

        if !notes.enabled || !notes.apply_channels.iter().any(|c| c == channel) {
            return MemoryNotesDecision {
                enabled: false,
                mode: notes.defaults.mode,
                allow_blocked_senders: notes.defaults.allow_blocked_senders,
                batch_interval_seconds: batch_interval,
                batch_max_messages: batch_max,
            };
        }

        let default_enabled = if is_group { notes.defaults.groups_enabled } else { notes.defaults.dms_enabled };
        let mut enabled = default_enabled;
        let mut mode = notes.defaults.mode;
        let mut allow_blocked = notes.defaults.allow_blocked_senders;

        if let Some(chan_settings) = self.memory_notes_defaults.get(channel) {
            if let Some(e) = chan_settings.enabled {
                enabled = e;
            }
            if let Some(m) = chan_settings.mode {
                mode = m;
            }
            if let Some(a) = chan_settings.allow_blocked_senders {
                allow_blocked = a;
            }
        }
        if let Some(chat_settings) = self.memory_notes_chat.get(&(channel.to_string(), chat_id.to_string())) {
            if let Some(e) = chat_settings.enabled {
                enabled = e;
            }
            if let Some(m) = chat_settings.mode {
                mode = m;
            }
            if let Some(a) = chat_settings.allow_blocked_senders {
                allow_blocked = a;
            }
        }

        MemoryNotesDecision {
            enabled,
            mode,
            allow_blocked_senders: allow_blocked,
            batch_interval_seconds: batch_interval,
            batch_max_messages: batch_max,
        }
    }

    /// Evaluates one actor/message against the compiled policy for its chat.
    pub fn evaluate(&self, actor: &ActorContext, all_tools: &HashSet<String>) -> PolicyDecision {
        if !self.apply_channels.contains(&actor.channel) {
            let mut decision = PolicyDecision::allow_all("policy_not_applied");
            decision.allowed_tools = {
                let mut tools: Vec<String> = all_tools.iter().cloned().collect();
                tools.sort();
                tools
            };
            return decision;
        }

        let compiled = match self.resolve_compiled_policy(&actor.channel, &actor.chat_id) {
            Some(c) => c,
            None => return PolicyDecision::allow_all("policy_not_applied"),
        };

        let is_owner = self.owner_match(actor);
        let notes = self.resolve_memory_notes_compiled(&actor.channel, &actor.chat_id, actor.is_group);
        let source_layer = self.source_layer(&actor.channel, &actor.chat_id).to_string();

        let mut decision = PolicyDecision {
            accept_message: false,
            should_respond: false,
            reason: None,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            persona_file: None,
            when_to_reply_mode: compiled.when_to_reply_mode,
            voice_output_mode: compiled.voice_output_mode,
            voice_tts_route: compiled.voice_tts_route.clone(),
            voice: compiled.voice.clone(),
            voice_format: compiled.voice_format.clone(),
            voice_max_sentences: compiled.voice_max_sentences,
            voice_max_chars: compiled.voice_max_chars,
            notes_enabled: notes.enabled,
            notes_mode: Some(notes.mode),
            notes_allow_blocked_senders: notes.allow_blocked_senders,
            notes_batch_interval_seconds: notes.batch_interval_seconds,
            notes_batch_max_messages: notes.batch_max_messages,
            is_owner,
            source_layer: Some(source_layer),
        };

        if self.sender_match(&actor.sender_primary, &actor.sender_aliases, &compiled.blocked_senders) {
            decision.reason = Some("blocked_sender".to_string());
            return decision;
        }

        let (accepted, accept_reason) = self.evaluate_who_can_talk(actor, &compiled);
        if !accepted {
            decision.reason = Some(accept_reason);
            return decision;
        }
        decision.accept_message = true;

        let (should_respond, reply_reason) = self.evaluate_when_to_reply(actor, &compiled);
        if !should_respond {
            decision.should_respond = false;
            decision.reason = Some(reply_reason);
            return decision;
        }

        decision.should_respond = true;
        decision.allowed_tools = self.resolve_allowed_tools(actor, &compiled, all_tools);
        decision.persona_file = compiled.persona_file.clone();
        decision.reason = Some(format!("{accept_reason}|{reply_reason}"));
        decision
    }

    /// Validates the loaded policy document: owner-only usage requires a
    /// non-empty owner list, tool references must exist in `known_tools`,
    /// persona file paths must resolve inside the workspace.
    pub fn validate(&self, known_tools: &HashSet<String>) -> Result<()> {
        self.validate_owner_only()?;
        self.validate_tools(known_tools)?;
        self.validate_persona_paths()?;
        Ok(())
    }

    fn validate_owner_only(&self) -> Result<()> {
        for channel in &self.apply_channels {
            let owners_empty = self
                .policy
                .owners
                .get(channel)
                .map(|o| o.is_empty())
                .unwrap_or(true);
            if owners_empty && chat_policy_uses_owner_only(&self.policy.defaults) {
                return Err(WardenError::PolicyValidation {
                    field: format!("defaults ({channel})"),
                    reason: format!("policy owner_only configured but owners.{channel} is empty"),
                });
            }
        }
        for (channel, channel_policy) in &self.policy.channels {
            if !self.apply_channels.contains(channel) {
                continue;
            }
            let owners_empty = self
                .policy
                .owners
                .get(channel)
                .map(|o| o.is_empty())
                .unwrap_or(true);
            if owners_empty && channel_uses_owner_only(channel_policy) {
                return Err(WardenError::PolicyValidation {
                    field: format!("channels.{channel}"),
                    reason: format!("policy owner_only configured for {channel} but owners.{channel} is empty"),
                });
            }
        }
        Ok(())
    }

    fn validate_tools(&self, known_tools: &HashSet<String>) -> Result<()> {
        check_allowed_tools_resolved(&self.policy.defaults.allowed_tools, "defaults.allowedTools", known_tools)?;
        check_tool_access_resolved(&self.policy.defaults.tool_access, "defaults.toolAccess", known_tools)?;

        for (channel, channel_policy) in &self.policy.channels {
            if let Some(at) = &channel_policy.default.allowed_tools {
                check_allowed_tools_override(at, &format!("channels.{channel}.default.allowedTools"), known_tools)?;
            }
            if let Some(ta) = &channel_policy.default.tool_access {
                check_tool_access_override(ta, &format!("channels.{channel}.default.toolAccess"), known_tools)?;
            }
            for (chat_id, chat_override) in &channel_policy.chats {
                if let Some(at) = &chat_override.allowed_tools {
                    check_allowed_tools_override(
                        at,
                        &format!("channels.{channel}.chats.{chat_id}.allowedTools"),
                        known_tools,
                    )?;
                }
                if let Some(ta) = &chat_override.tool_access {
                    check_tool_access_override(
                        ta,
                        &format!("channels.{channel}.chats.{chat_id}.toolAccess"),
                        known_tools,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn validate_persona_paths(&self) -> Result<()> {
        if let Some(p) = &self.policy.defaults.persona_file {
            resolve_persona_path(p, &self.workspace).map_err(|e| wrap_persona_error(e, "defaults.personaFile"))?;
        }
        for (channel, channel_policy) in &self.policy.channels {
            if let Some(p) = &channel_policy.default.persona_file {
                resolve_persona_path(p, &self.workspace)
                    .map_err(|e| wrap_persona_error(e, &format!("channels.{channel}.default.personaFile")))?;
            }
            for (chat_id, chat_override) in &channel_policy.chats {
                if let Some(p) = &chat_override.persona_file {
                    resolve_persona_path(p, &self.workspace).map_err(|e| {
                        wrap_persona_error(e, &format!("channels.{channel}.chats.{chat_id}.personaFile"))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Resolved, human-readable policy dump for `status-group`/`explain-group`.
    pub fn resolve_policy(&self, channel: &str, chat_id: &str) -> Option<EffectivePolicy> {
        let compiled = self.resolve_compiled_policy(channel, chat_id)?;
        let mut who = compiled.who_can_talk_senders.iter().cloned().collect::<Vec<_>>();
        who.sort();
        let mut when = compiled.when_to_reply_senders.iter().cloned().collect::<Vec<_>>();
        when.sort();
        let mut blocked = compiled.blocked_senders.iter().cloned().collect::<Vec<_>>();
        blocked.sort();
        let mut tools = compiled.allowed_tools_tools.iter().cloned().collect::<Vec<_>>();
        tools.sort();
        let mut deny = compiled.allowed_tools_deny.iter().cloned().collect::<Vec<_>>();
        deny.sort();

        Some(EffectivePolicy {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            source_layer: self.source_layer(channel, chat_id).to_string(),
            who_can_talk_mode: compiled.who_can_talk_mode,
            who_can_talk_senders: who,
            when_to_reply_mode: compiled.when_to_reply_mode,
            when_to_reply_senders: when,
            blocked_senders: blocked,
            allowed_tools_mode: compiled.allowed_tools_mode,
            allowed_tools_tools: tools,
            allowed_tools_deny: deny,
            persona_file: compiled.persona_file.clone(),
        })
    }
}

fn wrap_persona_error(err: WardenError, field: &str) -> WardenError {
    match err {
        WardenError::PolicyValidation { reason, .. } => WardenError::PolicyValidation {
            field: field.to_string(),
            reason,
        },
        other => other,
    }
}

fn chat_policy_uses_owner_only(policy: &ChatPolicy) -> bool {
    policy.who_can_talk.mode == WhoCanTalkMode::OwnerOnly
        || policy.when_to_reply.mode == WhenToReplyMode::OwnerOnly
        || policy.tool_access.values().any(|rule| rule.mode == ToolAccessMode::OwnerOnly)
}

fn override_uses_owner_only(over: &ChatPolicyOverride) -> bool {
    let who = over.who_can_talk.as_ref().and_then(|o| o.mode) == Some(WhoCanTalkMode::OwnerOnly);
    let when = over.when_to_reply.as_ref().and_then(|o| o.mode) == Some(WhenToReplyMode::OwnerOnly);
    let tool = over
        .tool_access
        .as_ref()
        .map(|m| m.values().any(|rule| rule.mode == Some(ToolAccessMode::OwnerOnly)))
        .unwrap_or(false);
    who || when || tool
}

fn channel_uses_owner_only(channel_policy: &crate::schema::ChannelPolicy) -> bool {
    override_uses_owner_only(&channel_policy.default)
        || channel_policy.chats.values().any(override_uses_owner_only)
}

fn check_allowed_tools_resolved(policy: &AllowedToolsPolicy, field: &str, known: &HashSet<String>) -> Result<()> {
    if policy.mode == AllowedToolsMode::Allowlist {
        check_subset(&policy.tools, field, known)?;
    }
    check_subset(&policy.deny, field, known)
}

fn check_allowed_tools_override(
    over: &crate::schema::AllowedToolsPolicyOverride,
    field: &str,
    known: &HashSet<String>,
) -> Result<()> {
    if over.mode == Some(AllowedToolsMode::Allowlist) {
        if let Some(tools) = &over.tools {
            check_subset(tools, field, known)?;
        }
    }
    if let Some(deny) = &over.deny {
        check_subset(deny, field, known)?;
    }
    Ok(())
}

fn check_tool_access_resolved(rules: &BTreeMap<String, ToolAccessRule>, field: &str, known: &HashSet<String>) -> Result<()> {
    let names: Vec<String> = rules.keys().cloned().collect();
    check_subset(&names, field, known)
}

fn check_tool_access_override(
    rules: &BTreeMap<String, crate::schema::ToolAccessRuleOverride>,
    field: &str,
    known: &HashSet<String>,
) -> Result<()> {
    let names: Vec<String> = rules.keys().cloned().collect();
    check_subset(&names, field, known)
}

fn check_subset(values: &[String], field: &str, known: &HashSet<String>) -> Result<()> {
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !known.contains(trimmed) {
            return Err(WardenError::PolicyValidation {
                field: field.to_string(),
                reason: format!("unknown tool: {trimmed}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ChannelPolicy, PolicyConfig, WhenToReplyPolicyOverride};

    fn actor(channel: &str, chat_id: &str, sender: &str, is_group: bool) -> ActorContext {
        ActorContext {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            sender_primary: sender.to_string(),
            sender_aliases: vec![sender.to_string()],
            is_group,
            mentioned_bot: false,
            reply_to_bot: false,
            content: String::new(),
            is_voice: false,
        }
    }

    #[test]
    fn default_mention_only_dm_always_responds() {
        let engine = PolicyEngine::new(PolicyConfig::default(), PathBuf::from("/tmp"), None);
        let all_tools: HashSet<String> = ["list_dir".to_string()].into_iter().collect();
        let decision = engine.evaluate(&actor("telegram", "123", "alice", false), &all_tools);
        assert!(decision.accept_message);
        assert!(decision.should_respond);
    }

    #[test]
    fn default_mention_only_group_without_mention_does_not_respond() {
        let engine = PolicyEngine::new(PolicyConfig::default(), PathBuf::from("/tmp"), None);
        let all_tools: HashSet<String> = ["list_dir".to_string()].into_iter().collect();
        let decision = engine.evaluate(&actor("telegram", "g1", "alice", true), &all_tools);
        assert!(decision.accept_message);
        assert!(!decision.should_respond);
    }

    #[test]
    fn blocked_sender_is_denied_before_who_can_talk() {
        let mut policy = PolicyConfig::default();
        let mut channel_policy = ChannelPolicy::default();
        channel_policy.default.blocked_senders = Some(crate::schema::BlockedSendersPolicyOverride {
            senders: Some(vec!["alice".to_string()]),
        });
        policy.channels.insert("telegram".to_string(), channel_policy);
        let engine = PolicyEngine::new(policy, PathBuf::from("/tmp"), None);
        let all_tools: HashSet<String> = HashSet::new();
        let decision = engine.evaluate(&actor("telegram", "123", "alice", false), &all_tools);
        assert!(!decision.accept_message);
        assert_eq!(decision.reason.as_deref(), Some("blocked_sender"));
    }

    #[test]
    fn chat_override_wins_over_channel_default() {
        let mut policy = PolicyConfig::default();
        let mut channel_policy = ChannelPolicy::default();
        channel_policy.chats.insert(
            "g1".to_string(),
            ChatPolicyOverride {
                when_to_reply: Some(WhenToReplyPolicyOverride {
                    mode: Some(WhenToReplyMode::All),
                    senders: None,
                }),
                ..Default::default()
            },
        );
        policy.channels.insert("telegram".to_string(), channel_policy);
        let engine = PolicyEngine::new(policy, PathBuf::from("/tmp"), None);
        let all_tools: HashSet<String> = HashSet::new();
        let decision = engine.evaluate(&actor("telegram", "g1", "alice", true), &all_tools);
        assert!(decision.should_respond);
    }

    #[test]
    fn exec_guardrail_removes_spawn_when_exec_not_allowed() {
        let mut policy = PolicyConfig::default();
        policy.defaults.allowed_tools = AllowedToolsPolicy {
            mode: AllowedToolsMode::Allowlist,
            tools: vec!["spawn".to_string()],
            deny: Vec::new(),
        };
        let engine = PolicyEngine::new(policy, PathBuf::from("/tmp"), None);
        let all_tools: HashSet<String> = ["spawn".to_string()].into_iter().collect();
        let decision = engine.evaluate(&actor("telegram", "dm1", "alice", false), &all_tools);
        assert!(!decision.allowed_tools.contains(&"spawn".to_string()));
    }

    #[test]
    fn unknown_tool_reference_fails_validation() {
        let mut policy = PolicyConfig::default();
        policy.defaults.allowed_tools = AllowedToolsPolicy {
            mode: AllowedToolsMode::Allowlist,
            tools: vec!["nonexistent_tool".to_string()],
            deny: Vec::new(),
        };
        let engine = PolicyEngine::new(policy, PathBuf::from("/tmp"), None);
        let known: HashSet<String> = ["list_dir".to_string()].into_iter().collect();
        assert!(engine.validate(&known).is_err());
    }

    #[test]
    fn owner_only_without_owners_fails_validation() {
        let mut policy = PolicyConfig::default();
        policy.defaults.who_can_talk.mode = WhoCanTalkMode::OwnerOnly;
        let engine = PolicyEngine::new(policy, PathBuf::from("/tmp"), None);
        let known: HashSet<String> = HashSet::new();
        assert!(engine.validate(&known).is_err());
    }
}
