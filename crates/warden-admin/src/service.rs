//! Executes `/policy ...` commands against `policy.json`, with rate
//! limiting, dry-run/validate/write/audit mutation discipline, and rollback.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use uuid::Uuid;
use warden_core::{GroupDirectoryPort, Result as WResult, WhenToReplyMode, WhoCanTalkMode};
use warden_policy::schema::{
    BlockedSendersPolicyOverride, ChatPolicyOverride, WhenToReplyPolicyOverride, WhoCanTalkPolicyOverride,
};
use warden_policy::{load_policy, normalize_identity_token, save_policy, PolicyConfig, PolicyEngine};

use crate::audit::{PolicyAuditEntry, PolicyAuditStore};
use crate::contracts::{ActorSource, PolicyActorContext, PolicyCommand, PolicyExecutionOptions, PolicyExecutionResult, PolicyOutcome};
use crate::registry::PolicyCommandRegistry;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const MIN_GROUP_QUERY_LEN: usize = 4;

/// One resolved group record used by `list-groups`/`resolve-group`.
struct GroupRecord {
    chat_id: String,
    alias: String,
    comment: String,
    tags: Vec<String>,
}

pub struct PolicyAdminService {
    policy_path: PathBuf,
    workspace: PathBuf,
    known_tools: HashSet<String>,
    apply_channels: HashSet<String>,
    group_directory: Option<std::sync::Arc<dyn GroupDirectoryPort>>,
    registry: PolicyCommandRegistry,
    audit: PolicyAuditStore,
    rate_limit_windows: Mutex<BTreeMap<String, VecDeque<Instant>>>,
}

impl PolicyAdminService {
    pub fn new(
        policy_path: PathBuf,
        workspace: PathBuf,
        known_tools: HashSet<String>,
        apply_channels: HashSet<String>,
        group_directory: Option<std::sync::Arc<dyn GroupDirectoryPort>>,
    ) -> Self {
        let audit = PolicyAuditStore::new(&policy_path);
        Self {
            policy_path,
            workspace,
            known_tools,
            apply_channels,
            group_directory,
            registry: PolicyCommandRegistry::new(),
            audit,
            rate_limit_windows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &PolicyCommandRegistry {
        &self.registry
    }

    pub fn usage(&self) -> String {
        self.registry.usage_lines().join("\n")
    }

    pub async fn execute_from_text(
        &self,
        raw_text: &str,
        actor: &PolicyActorContext,
        options: Option<PolicyExecutionOptions>,
    ) -> PolicyExecutionResult {
        let command = match self.registry.parse_slash_command(raw_text) {
            Ok(c) => c,
            Err(e) => {
                return self.result(PolicyOutcome::Invalid, actor, "", format!("Invalid command: {e}"), Defaults::default());
            }
        };
        self.execute(&command, actor, options).await
    }

    pub async fn execute(
        &self,
        command: &PolicyCommand,
        actor: &PolicyActorContext,
        options: Option<PolicyExecutionOptions>,
    ) -> PolicyExecutionResult {
        let exec_opts = options.unwrap_or_default();

        if command.namespace.trim().to_lowercase() != "policy" {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                &command.subcommand,
                format!("Unknown command '/{}'. Try /policy help.", command.namespace),
                Defaults { unknown_command: true, dry_run: exec_opts.dry_run, ..Default::default() },
            );
        }

        let subcommand = self.registry.normalize_subcommand(&command.subcommand);
        let (argv, exec_opts) = self.registry.split_options(&command.argv, exec_opts);
        let Some(spec) = self.registry.get_spec(&subcommand) else {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                &subcommand,
                format!("Unknown command '/policy {subcommand}'. Try /policy help."),
                Defaults { unknown_command: true, dry_run: exec_opts.dry_run, ..Default::default() },
            );
        };

        if actor.source == ActorSource::Dm && !actor.is_owner {
            return self.result(
                PolicyOutcome::Denied,
                actor,
                &subcommand,
                "Policy command denied.".to_string(),
                Defaults { dry_run: exec_opts.dry_run, ..Default::default() },
            );
        }

        let policy = match load_policy(&self.policy_path) {
            Ok(p) => p,
            Err(e) => {
                return self.result(
                    PolicyOutcome::Error,
                    actor,
                    &subcommand,
                    format!("Failed to load policy: {e}"),
                    Defaults { dry_run: exec_opts.dry_run, ..Default::default() },
                );
            }
        };

        if let Some(message) = self.rate_limit_message(actor, &policy) {
            return self.result(
                PolicyOutcome::Denied,
                actor,
                &subcommand,
                message,
                Defaults { dry_run: exec_opts.dry_run, ..Default::default() },
            );
        }

        if spec.risky && policy.runtime.admin_require_confirm_for_risky && !exec_opts.confirm {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                &subcommand,
                "Risky command requires --confirm (runtime.adminRequireConfirmForRisky=true).".to_string(),
                Defaults { dry_run: exec_opts.dry_run, ..Default::default() },
            );
        }

        match subcommand.as_str() {
            "help" => self.handle_help(actor),
            "list-groups" => self.handle_list_groups(&policy, actor, &argv).await,
            "resolve-group" => self.handle_resolve_group(&policy, actor, &argv).await,
            "status-group" => self.handle_status_group(&policy, actor, &argv).await,
            "explain-group" => self.handle_explain_group(&policy, actor, &argv).await,
            "allow-group" => self.handle_allow_group(&policy, actor, &argv, exec_opts, &command.raw_text),
            "block-group" => self.handle_block_group(&policy, actor, &argv, exec_opts, &command.raw_text),
            "set-when" => self.handle_set_when(&policy, actor, &argv, exec_opts, &command.raw_text),
            "set-persona" => self.handle_set_persona(&policy, actor, &argv, exec_opts, &command.raw_text),
            "clear-persona" => self.handle_clear_persona(&policy, actor, &argv, exec_opts, &command.raw_text),
            "block-sender" => self.handle_block_sender(&policy, actor, &argv, exec_opts, &command.raw_text),
            "unblock-sender" => self.handle_unblock_sender(&policy, actor, &argv, exec_opts, &command.raw_text),
            "list-blocked" => self.handle_list_blocked(&policy, actor, &argv),
            "history" => self.handle_history(actor, &argv),
            "rollback" => self.handle_rollback(&policy, actor, &argv, exec_opts, &command.raw_text),
            _ => unreachable!("registry/dispatch mismatch for {subcommand}"),
        }
    }

    fn rate_limit_message(&self, actor: &PolicyActorContext, policy: &PolicyConfig) -> Option<String> {
        if actor.source != ActorSource::Dm {
            return None;
        }
        let limit = policy.runtime.admin_command_rate_limit_per_minute as usize;
        let now = Instant::now();
        let key = format!("dm:{}", normalize_identity_token(&actor.sender_id));
        let mut windows = self.rate_limit_windows.lock().unwrap();
        let window = windows.entry(key).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= RATE_LIMIT_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= limit {
            return Some(format!("Policy command rate limit exceeded ({limit}/minute). Try again shortly."));
        }
        window.push_back(now);
        None
    }

    fn validate_policy(&self, policy: &PolicyConfig) -> WResult<()> {
        let engine = PolicyEngine::new(policy.clone(), self.workspace.clone(), Some(self.apply_channels.iter().cloned().collect()));
        engine.validate(&self.known_tools)
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_policy(
        &self,
        before: &PolicyConfig,
        after: &PolicyConfig,
        actor: &PolicyActorContext,
        command_name: &str,
        command_raw: &str,
        dry_run: bool,
        is_rollback: bool,
    ) -> PolicyExecutionResult {
        let before_hash = match PolicyAuditStore::policy_hash(before) {
            Ok(h) => h,
            Err(e) => {
                return self.result(
                    PolicyOutcome::Error,
                    actor,
                    command_name,
                    format!("Failed to hash policy: {e}"),
                    Defaults { dry_run, is_rollback, ..Default::default() },
                );
            }
        };
        let after_hash = match PolicyAuditStore::policy_hash(after) {
            Ok(h) => h,
            Err(e) => {
                return self.result(
                    PolicyOutcome::Error,
                    actor,
                    command_name,
                    format!("Failed to hash policy: {e}"),
                    Defaults { dry_run, is_rollback, ..Default::default() },
                );
            }
        };

        if before_hash == after_hash {
            return self.result(
                PolicyOutcome::Noop,
                actor,
                command_name,
                "No policy changes required.".to_string(),
                Defaults {
                    before_hash: Some(before_hash),
                    after_hash: Some(after_hash),
                    dry_run,
                    is_rollback,
                    ..Default::default()
                },
            );
        }

        if let Err(e) = self.validate_policy(after) {
            return self.result(
                PolicyOutcome::Error,
                actor,
                command_name,
                format!("Failed to apply policy change: {e}"),
                Defaults {
                    before_hash: Some(before_hash),
                    after_hash: Some(after_hash),
                    dry_run,
                    is_rollback,
                    ..Default::default()
                },
            );
        }

        if dry_run {
            return self.result(
                PolicyOutcome::Applied,
                actor,
                command_name,
                format!("Dry-run: changes validated for {command_name}."),
                Defaults {
                    mutated: true,
                    before_hash: Some(before_hash),
                    after_hash: Some(after_hash),
                    dry_run: true,
                    is_rollback,
                    ..Default::default()
                },
            );
        }

        let change_id = Uuid::new_v4().simple().to_string();
        let backup_ref = match self.audit.write_backup(&change_id, before) {
            Ok(r) => r,
            Err(e) => {
                return self.result(
                    PolicyOutcome::Error,
                    actor,
                    command_name,
                    format!("Failed to write policy backup: {e}"),
                    Defaults {
                        before_hash: Some(before_hash),
                        after_hash: Some(after_hash),
                        dry_run,
                        is_rollback,
                        ..Default::default()
                    },
                );
            }
        };

        if let Err(e) = save_policy(after, &self.policy_path) {
            return self.result(
                PolicyOutcome::Error,
                actor,
                command_name,
                format!("Failed to write policy: {e}"),
                Defaults {
                    before_hash: Some(before_hash),
                    after_hash: Some(after_hash),
                    backup_ref: Some(backup_ref),
                    audit_id: Some(change_id),
                    dry_run,
                    is_rollback,
                    ..Default::default()
                },
            );
        }

        let entry = PolicyAuditEntry {
            id: change_id.clone(),
            timestamp: PolicyAuditStore::now_iso(),
            actor_source: actor.source.as_str().to_string(),
            actor_id: actor.sender_id.clone(),
            channel: actor.channel.clone(),
            chat_id: actor.chat_id.clone(),
            command_raw: command_raw.to_string(),
            dry_run,
            result: "applied".to_string(),
            before_hash: Some(before_hash.clone()),
            after_hash: Some(after_hash.clone()),
            backup_ref: Some(backup_ref.clone()),
            error: None,
        };
        let audit_write_failed = self.audit.append(&entry).is_err();

        let mut message = "Policy updated successfully.".to_string();
        if audit_write_failed {
            message.push_str(" Warning: audit write failed.");
        }

        self.result(
            PolicyOutcome::Applied,
            actor,
            command_name,
            message,
            Defaults {
                mutated: true,
                before_hash: Some(before_hash),
                after_hash: Some(after_hash),
                backup_ref: Some(backup_ref),
                audit_id: Some(change_id),
                dry_run,
                audit_write_failed,
                is_rollback,
                ..Default::default()
            },
        )
    }

    fn result(
        &self,
        outcome: PolicyOutcome,
        actor: &PolicyActorContext,
        command_name: &str,
        message: String,
        defaults: Defaults,
    ) -> PolicyExecutionResult {
        PolicyExecutionResult {
            outcome,
            message,
            mutated: defaults.mutated,
            before_hash: defaults.before_hash,
            after_hash: defaults.after_hash,
            audit_id: defaults.audit_id,
            backup_ref: defaults.backup_ref,
            command_name: command_name.to_string(),
            source: actor.source,
            dry_run: defaults.dry_run,
            unknown_command: defaults.unknown_command,
            audit_write_failed: defaults.audit_write_failed,
            is_rollback: defaults.is_rollback,
            meta: BTreeMap::new(),
        }
    }

    fn parse_group_chat_id(&self, value: &str) -> Result<String, String> {
        let chat_id = value.trim();
        if chat_id.contains(' ') || !chat_id.ends_with("@g.us") {
            return Err("chat id must be a WhatsApp group id ending in @g.us".to_string());
        }
        Ok(chat_id.to_string())
    }

    fn parse_when_mode(&self, value: &str) -> Result<WhenToReplyMode, String> {
        let mut mode = value.trim().to_lowercase().replace('-', "_");
        mode = match mode.as_str() {
            "mention" | "mentions" | "mentiononly" => "mention_only".to_string(),
            "allowed" => "allowed_senders".to_string(),
            "owner" => "owner_only".to_string(),
            other => other.to_string(),
        };
        match mode.as_str() {
            "all" => Ok(WhenToReplyMode::All),
            "mention_only" => Ok(WhenToReplyMode::MentionOnly),
            "allowed_senders" => Ok(WhenToReplyMode::AllowedSenders),
            "owner_only" => Ok(WhenToReplyMode::OwnerOnly),
            "off" => Ok(WhenToReplyMode::Off),
            _ => Err("mode must be one of: all, mention_only, allowed_senders, owner_only, off".to_string()),
        }
    }

    fn whatsapp_chat_override<'a>(&self, policy: &'a mut PolicyConfig, chat_id: &str) -> Result<&'a mut ChatPolicyOverride, String> {
        let channel = policy
            .channels
            .get_mut("whatsapp")
            .ok_or_else(|| "whatsapp channel is missing in policy".to_string())?;
        Ok(channel.chats.entry(chat_id.to_string()).or_default())
    }

    fn chat_alias(chat_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(chat_id.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("g-{}", &digest[..10])
    }

    /// Group records sourced from `policy.channels.whatsapp.chats`, enriched
    /// by an optional runtime-supplied bridge subject.
    async fn discover_groups(&self, policy: &PolicyConfig) -> Vec<GroupRecord> {
        let mut records = Vec::new();
        if let Some(wa) = policy.channels.get("whatsapp") {
            for (chat_id, over) in &wa.chats {
                if !chat_id.ends_with("@g.us") {
                    continue;
                }
                let comment = over.comment.clone().unwrap_or_default().trim().to_string();
                let comment = match &self.group_directory {
                    Some(dir) if comment.is_empty() => dir.subject_for(chat_id).await.unwrap_or_default(),
                    _ => comment,
                };
                let tags: Vec<String> = over
                    .group_tags
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                records.push(GroupRecord {
                    chat_id: chat_id.clone(),
                    alias: Self::chat_alias(chat_id),
                    comment,
                    tags,
                });
            }
        }
        records
    }

    fn match_group_query<'a>(&self, query: &str, records: &'a [GroupRecord]) -> (Option<&'a GroupRecord>, Vec<&'a GroupRecord>) {
        let target = query.trim();
        if target.is_empty() {
            return (None, Vec::new());
        }
        if let Some(rec) = records.iter().find(|r| r.chat_id == target) {
            return (Some(rec), Vec::new());
        }

        let by_alias: Vec<&GroupRecord> = records.iter().filter(|r| r.alias == target).collect();
        if by_alias.len() == 1 {
            return (Some(by_alias[0]), Vec::new());
        } else if by_alias.len() > 1 {
            return (None, by_alias);
        }

        let by_tag: Vec<&GroupRecord> = records.iter().filter(|r| r.tags.iter().any(|t| t == target)).collect();
        if by_tag.len() == 1 {
            return (Some(by_tag[0]), Vec::new());
        } else if by_tag.len() > 1 {
            return (None, by_tag);
        }

        let lowered = target.to_lowercase();
        let ci_comment: Vec<&GroupRecord> = records.iter().filter(|r| !r.comment.is_empty() && r.comment.to_lowercase() == lowered).collect();
        if ci_comment.len() == 1 {
            return (Some(ci_comment[0]), Vec::new());
        } else if ci_comment.len() > 1 {
            return (None, ci_comment);
        }

        let ci_tag: Vec<&GroupRecord> = records
            .iter()
            .filter(|r| r.tags.iter().any(|t| t.to_lowercase() == lowered))
            .collect();
        if ci_tag.len() == 1 {
            return (Some(ci_tag[0]), Vec::new());
        } else if ci_tag.len() > 1 {
            return (None, ci_tag);
        }

        let lowered_compact: String = lowered.chars().filter(|c| c.is_alphanumeric()).collect();
        if lowered_compact.chars().count() >= MIN_GROUP_QUERY_LEN {
            let matches_value = |value: &str| -> bool {
                let raw = value.trim().to_lowercase();
                if raw.is_empty() {
                    return false;
                }
                if raw.contains(&lowered) {
                    return true;
                }
                let raw_compact: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
                !raw_compact.is_empty() && raw_compact.contains(&lowered_compact)
            };
            let partial: Vec<&GroupRecord> = records
                .iter()
                .filter(|r| matches_value(&r.alias) || matches_value(&r.comment) || r.tags.iter().any(|t| matches_value(t)))
                .collect();
            if partial.len() == 1 {
                return (Some(partial[0]), Vec::new());
            } else if partial.len() > 1 {
                return (None, partial);
            }
        }

        (None, Vec::new())
    }

    fn source_layer(policy: &PolicyConfig, chat_id: &str, field: &str) -> &'static str {
        let Some(wa) = policy.channels.get("whatsapp") else {
            return "default";
        };
        let mut source = "default";
        let channel_has_field = match field {
            "who_can_talk" => wa.default.who_can_talk.is_some(),
            "when_to_reply" => wa.default.when_to_reply.is_some(),
            "blocked_senders" => wa.default.blocked_senders.is_some(),
            "allowed_tools" => wa.default.allowed_tools.is_some(),
            "persona_file" => wa.default.persona_file.is_some(),
            _ => false,
        };
        if channel_has_field {
            source = "channel";
        }
        if let Some(over) = wa.chats.get(chat_id) {
            let chat_has_field = match field {
                "who_can_talk" => over.who_can_talk.is_some(),
                "when_to_reply" => over.when_to_reply.is_some(),
                "blocked_senders" => over.blocked_senders.is_some(),
                "allowed_tools" => over.allowed_tools.is_some(),
                "persona_file" => over.persona_file.is_some(),
                _ => false,
            };
            if chat_has_field {
                source = "chat";
            }
        }
        source
    }

    fn handle_help(&self, actor: &PolicyActorContext) -> PolicyExecutionResult {
        self.result(PolicyOutcome::Noop, actor, "help", self.usage(), Defaults::default())
    }

    async fn handle_list_groups(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String]) -> PolicyExecutionResult {
        if argv.len() > 1 {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "list-groups",
                "Usage: /policy list-groups [query]".to_string(),
                Defaults::default(),
            );
        }
        let query = argv.first().map(|q| q.trim().to_lowercase()).unwrap_or_default();
        let records = self.discover_groups(policy).await;
        if records.is_empty() {
            return self.result(
                PolicyOutcome::Noop,
                actor,
                "list-groups",
                "No WhatsApp groups discovered yet.".to_string(),
                Defaults::default(),
            );
        }

        let mut rows: Vec<&GroupRecord> = records
            .iter()
            .filter(|r| {
                if query.is_empty() {
                    return true;
                }
                r.chat_id.to_lowercase().contains(&query)
                    || r.comment.to_lowercase().contains(&query)
                    || r.alias.to_lowercase().contains(&query)
                    || r.tags.iter().any(|t| t.to_lowercase().contains(&query))
            })
            .collect();

        if rows.is_empty() {
            return self.result(
                PolicyOutcome::Noop,
                actor,
                "list-groups",
                format!("No WhatsApp groups matched '{query}'."),
                Defaults::default(),
            );
        }
        rows.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));

        const MAX_ROWS: usize = 40;
        let mut lines = vec![format!("Known WhatsApp groups: {} (showing {})", rows.len(), rows.len().min(MAX_ROWS))];
        for rec in rows.iter().take(MAX_ROWS) {
            let tags_suffix = if rec.tags.is_empty() { String::new() } else { format!(" | tags: {}", rec.tags.join(", ")) };
            if rec.comment.is_empty() {
                lines.push(format!("- {} | {}{}", rec.alias, rec.chat_id, tags_suffix));
            } else {
                lines.push(format!("- {} | {} | {}{}", rec.alias, rec.chat_id, rec.comment, tags_suffix));
            }
        }
        if rows.len() > MAX_ROWS {
            lines.push(format!("... and {} more", rows.len() - MAX_ROWS));
        }
        lines.push("Use: /policy resolve-group <name_or_id>".to_string());

        self.result(PolicyOutcome::Noop, actor, "list-groups", lines.join("\n"), Defaults::default())
    }

    async fn handle_resolve_group(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String]) -> PolicyExecutionResult {
        if argv.len() != 1 || argv[0].trim().is_empty() {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "resolve-group",
                "Usage: /policy resolve-group <name_or_id>".to_string(),
                Defaults::default(),
            );
        }
        let query = argv[0].trim();
        let records = self.discover_groups(policy).await;
        let (resolved, ambiguous) = self.match_group_query(query, &records);

        if let Some(rec) = resolved {
            let suffix = if rec.comment.is_empty() { String::new() } else { format!(" | {}", rec.comment) };
            let tags_suffix = if rec.tags.is_empty() { String::new() } else { format!(" | tags: {}", rec.tags.join(", ")) };
            return self.result(
                PolicyOutcome::Noop,
                actor,
                "resolve-group",
                format!("Resolved '{}' -> {} ({}){}{}", query, rec.chat_id, rec.alias, suffix, tags_suffix),
                Defaults::default(),
            );
        }

        if !ambiguous.is_empty() {
            let mut lines = vec![format!("Ambiguous group reference '{query}'. Matches:")];
            for rec in ambiguous.iter().take(10) {
                if rec.comment.is_empty() {
                    lines.push(format!("- {} | {}", rec.alias, rec.chat_id));
                } else {
                    lines.push(format!("- {} | {} | {}", rec.alias, rec.chat_id, rec.comment));
                }
            }
            return self.result(PolicyOutcome::Invalid, actor, "resolve-group", lines.join("\n"), Defaults::default());
        }

        self.result(
            PolicyOutcome::Invalid,
            actor,
            "resolve-group",
            format!("No group matched '{query}'. Try /policy list-groups."),
            Defaults::default(),
        )
    }

    async fn resolve_existing_chat(&self, policy: &PolicyConfig, value: &str) -> Result<String, String> {
        let candidate = value.trim();
        if candidate.is_empty() {
            return Err("chat id cannot be empty".to_string());
        }
        if candidate.ends_with("@g.us") {
            return Ok(candidate.to_string());
        }
        let records = self.discover_groups(policy).await;
        let (resolved, ambiguous) = self.match_group_query(candidate, &records);
        if let Some(rec) = resolved {
            return Ok(rec.chat_id.clone());
        }
        if !ambiguous.is_empty() {
            return Err(format!("group reference is ambiguous: {candidate}"));
        }
        Err(format!("unknown group reference: {candidate}"))
    }

    async fn handle_status_group(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String]) -> PolicyExecutionResult {
        if argv.len() != 1 {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "status-group",
                "Usage: /policy status-group <chat_id@g.us>".to_string(),
                Defaults::default(),
            );
        }
        let chat_id = match self.resolve_existing_chat(policy, &argv[0]).await {
            Ok(c) => c,
            Err(e) => {
                return self.result(PolicyOutcome::Invalid, actor, "status-group", format!("Invalid status-group arguments: {e}"), Defaults::default());
            }
        };

        let engine = PolicyEngine::new(policy.clone(), self.workspace.clone(), Some(self.apply_channels.iter().cloned().collect()));
        let Some(effective) = engine.resolve_policy("whatsapp", &chat_id) else {
            return self.result(PolicyOutcome::Error, actor, "status-group", "Failed to resolve policy.".to_string(), Defaults::default());
        };

        let lines = vec![
            chat_id.clone(),
            format!("whoCanTalk={} (source={})", effective.who_can_talk_mode, Self::source_layer(policy, &chat_id, "who_can_talk")),
            format!("whenToReply={} (source={})", effective.when_to_reply_mode, Self::source_layer(policy, &chat_id, "when_to_reply")),
            format!("blockedSenders={} (source={})", effective.blocked_senders.join(","), Self::source_layer(policy, &chat_id, "blocked_senders")),
            format!("personaFile={} (source={})", effective.persona_file.as_deref().unwrap_or("-"), Self::source_layer(policy, &chat_id, "persona_file")),
            format!("allowedTools.mode={} (source={})", allowed_tools_mode_str(effective.allowed_tools_mode), Self::source_layer(policy, &chat_id, "allowed_tools")),
            format!("allowedTools.tools={}", effective.allowed_tools_tools.join(",")),
            format!("allowedTools.deny={}", effective.allowed_tools_deny.join(",")),
        ];
        self.result(PolicyOutcome::Noop, actor, "status-group", lines.join("\n"), Defaults::default())
    }

    async fn handle_explain_group(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String]) -> PolicyExecutionResult {
        if argv.len() != 1 {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "explain-group",
                "Usage: /policy explain-group <chat_id@g.us>".to_string(),
                Defaults::default(),
            );
        }
        let chat_id = match self.resolve_existing_chat(policy, &argv[0]).await {
            Ok(c) => c,
            Err(e) => {
                return self.result(PolicyOutcome::Invalid, actor, "explain-group", format!("Invalid explain-group arguments: {e}"), Defaults::default());
            }
        };
        let engine = PolicyEngine::new(policy.clone(), self.workspace.clone(), Some(self.apply_channels.iter().cloned().collect()));
        let Some(effective) = engine.resolve_policy("whatsapp", &chat_id) else {
            return self.result(PolicyOutcome::Error, actor, "explain-group", "Failed to resolve policy.".to_string(), Defaults::default());
        };

        let lines = vec![
            format!("Group explain: {chat_id}"),
            "merge_trace=defaults -> channels.whatsapp.default -> channels.whatsapp.chats.<chat_id>".to_string(),
            format!("whoCanTalk.source={}", Self::source_layer(policy, &chat_id, "who_can_talk")),
            format!("whenToReply.source={}", Self::source_layer(policy, &chat_id, "when_to_reply")),
            format!("blockedSenders.source={}", Self::source_layer(policy, &chat_id, "blocked_senders")),
            format!("allowedTools.source={}", Self::source_layer(policy, &chat_id, "allowed_tools")),
            format!("personaFile.source={}", Self::source_layer(policy, &chat_id, "persona_file")),
            format!("effective.whoCanTalk={}", effective.who_can_talk_mode),
            format!("effective.whenToReply={}", effective.when_to_reply_mode),
            format!("effective.blockedSenders={}", effective.blocked_senders.join(",")),
            format!("effective.personaFile={}", effective.persona_file.as_deref().unwrap_or("-")),
            format!("effective.allowedTools.mode={}", allowed_tools_mode_str(effective.allowed_tools_mode)),
            format!("effective.allowedTools.tools={}", effective.allowed_tools_tools.join(",")),
            format!("effective.allowedTools.deny={}", effective.allowed_tools_deny.join(",")),
        ];
        self.result(PolicyOutcome::Noop, actor, "explain-group", lines.join("\n"), Defaults::default())
    }

    fn handle_allow_group(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 1 {
            return self.result(PolicyOutcome::Invalid, actor, "allow-group", "Usage: /policy allow-group <chat_id@g.us>".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "allow-group", format!("Invalid allow-group arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };

        let mut after = policy.clone();
        let Ok(over) = self.whatsapp_chat_override(&mut after, &chat_id) else {
            return self.result(PolicyOutcome::Invalid, actor, "allow-group", "whatsapp channel is missing in policy".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        };
        over.who_can_talk = Some(WhoCanTalkPolicyOverride { mode: Some(WhoCanTalkMode::Everyone), senders: Some(Vec::new()) });

        let result = self.commit_policy(policy, &after, actor, "allow-group", raw_text, options.dry_run, false);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Policy updated for {chat_id}: whoCanTalk=everyone.");
            r
        } else {
            result
        }
    }

    fn handle_block_group(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 1 {
            return self.result(PolicyOutcome::Invalid, actor, "block-group", "Usage: /policy block-group <chat_id@g.us>".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "block-group", format!("Invalid block-group arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };

        let owner_senders = policy.owners.get("whatsapp").cloned().unwrap_or_default();
        if owner_senders.is_empty() {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "block-group",
                "Cannot block group: owners.whatsapp is empty in policy.".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }

        let mut after = policy.clone();
        let Ok(over) = self.whatsapp_chat_override(&mut after, &chat_id) else {
            return self.result(PolicyOutcome::Invalid, actor, "block-group", "whatsapp channel is missing in policy".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        };
        over.who_can_talk = Some(WhoCanTalkPolicyOverride { mode: Some(WhoCanTalkMode::Allowlist), senders: Some(owner_senders) });

        let result = self.commit_policy(policy, &after, actor, "block-group", raw_text, options.dry_run, false);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Policy updated for {chat_id}: whoCanTalk=allowlist (owners only).");
            r
        } else {
            result
        }
    }

    fn handle_set_when(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 2 {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "set-when",
                "Usage: /policy set-when <chat_id@g.us> <all|mention_only|allowed_senders|owner_only|off>".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "set-when", format!("Invalid set-when arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };
        let mode = match self.parse_when_mode(&argv[1]) {
            Ok(m) => m,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "set-when", format!("Invalid set-when arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };

        let mut after = policy.clone();
        let Ok(over) = self.whatsapp_chat_override(&mut after, &chat_id) else {
            return self.result(PolicyOutcome::Invalid, actor, "set-when", "whatsapp channel is missing in policy".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        };
        over.when_to_reply = Some(WhenToReplyPolicyOverride { mode: Some(mode), senders: Some(Vec::new()) });

        let result = self.commit_policy(policy, &after, actor, "set-when", raw_text, options.dry_run, false);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Policy updated for {chat_id}: whenToReply={mode}.");
            r
        } else {
            result
        }
    }

    fn handle_set_persona(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 2 {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "set-persona",
                "Usage: /policy set-persona <chat_id@g.us> <persona_path>".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "set-persona", format!("Invalid set-persona arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };
        let persona_path = argv[1].trim();
        if persona_path.is_empty() {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "set-persona",
                "Invalid set-persona arguments: persona_path cannot be empty".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }

        let mut after = policy.clone();
        let Ok(over) = self.whatsapp_chat_override(&mut after, &chat_id) else {
            return self.result(PolicyOutcome::Invalid, actor, "set-persona", "whatsapp channel is missing in policy".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        };
        over.persona_file = Some(persona_path.to_string());

        let result = self.commit_policy(policy, &after, actor, "set-persona", raw_text, options.dry_run, false);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Policy updated for {chat_id}: personaFile={persona_path}.");
            r
        } else {
            result
        }
    }

    fn handle_clear_persona(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 1 {
            return self.result(PolicyOutcome::Invalid, actor, "clear-persona", "Usage: /policy clear-persona <chat_id@g.us>".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "clear-persona", format!("Invalid clear-persona arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };

        let mut after = policy.clone();
        let Ok(over) = self.whatsapp_chat_override(&mut after, &chat_id) else {
            return self.result(PolicyOutcome::Invalid, actor, "clear-persona", "whatsapp channel is missing in policy".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        };
        over.persona_file = None;

        let result = self.commit_policy(policy, &after, actor, "clear-persona", raw_text, options.dry_run, false);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Policy updated for {chat_id}: personaFile cleared (inherits channel/default policy).");
            r
        } else {
            result
        }
    }

    fn handle_block_sender(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 2 {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "block-sender",
                "Usage: /policy block-sender <chat_id@g.us> <sender_id>".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "block-sender", format!("Invalid block-sender arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };
        let sender = argv[1].trim();
        let sender_key = normalize_identity_token(sender);
        if sender_key.is_empty() {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "block-sender",
                "Invalid block-sender arguments: sender_id cannot be empty".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }

        let mut after = policy.clone();
        let Ok(over) = self.whatsapp_chat_override(&mut after, &chat_id) else {
            return self.result(PolicyOutcome::Invalid, actor, "block-sender", "whatsapp channel is missing in policy".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        };
        let mut current = over.blocked_senders.as_ref().and_then(|b| b.senders.clone()).unwrap_or_default();
        let already_present = current.iter().any(|v| normalize_identity_token(v) == sender_key);
        if !already_present {
            current.push(sender.to_string());
        }
        over.blocked_senders = Some(BlockedSendersPolicyOverride { senders: Some(current) });

        let result = self.commit_policy(policy, &after, actor, "block-sender", raw_text, options.dry_run, false);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Policy updated for {chat_id}: blocked sender {sender}.");
            r
        } else {
            result
        }
    }

    fn handle_unblock_sender(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 2 {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "unblock-sender",
                "Usage: /policy unblock-sender <chat_id@g.us> <sender_id>".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "unblock-sender", format!("Invalid unblock-sender arguments: {e}"), Defaults { dry_run: options.dry_run, ..Default::default() }),
        };
        let sender = argv[1].trim();
        let sender_key = normalize_identity_token(sender);
        if sender_key.is_empty() {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "unblock-sender",
                "Invalid unblock-sender arguments: sender_id cannot be empty".to_string(),
                Defaults { dry_run: options.dry_run, ..Default::default() },
            );
        }

        let mut after = policy.clone();
        let Ok(over) = self.whatsapp_chat_override(&mut after, &chat_id) else {
            return self.result(PolicyOutcome::Invalid, actor, "unblock-sender", "whatsapp channel is missing in policy".to_string(), Defaults { dry_run: options.dry_run, ..Default::default() });
        };
        let current = over.blocked_senders.as_ref().and_then(|b| b.senders.clone()).unwrap_or_default();
        let updated: Vec<String> = current.into_iter().filter(|v| normalize_identity_token(v) != sender_key).collect();
        over.blocked_senders = Some(BlockedSendersPolicyOverride { senders: Some(updated) });

        let result = self.commit_policy(policy, &after, actor, "unblock-sender", raw_text, options.dry_run, false);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Policy updated for {chat_id}: unblocked sender {sender}.");
            r
        } else {
            result
        }
    }

    fn handle_list_blocked(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String]) -> PolicyExecutionResult {
        if argv.len() != 1 {
            return self.result(PolicyOutcome::Invalid, actor, "list-blocked", "Usage: /policy list-blocked <chat_id@g.us>".to_string(), Defaults::default());
        }
        let chat_id = match self.parse_group_chat_id(&argv[0]) {
            Ok(c) => c,
            Err(e) => return self.result(PolicyOutcome::Invalid, actor, "list-blocked", format!("Invalid list-blocked arguments: {e}"), Defaults::default()),
        };

        let values = policy
            .channels
            .get("whatsapp")
            .and_then(|wa| wa.chats.get(&chat_id))
            .and_then(|over| over.blocked_senders.as_ref())
            .and_then(|b| b.senders.clone())
            .unwrap_or_default();

        let message = if values.is_empty() {
            format!("{chat_id}: blockedSenders is empty.")
        } else {
            let mut lines = vec![format!("{chat_id}: blockedSenders ({})", values.len())];
            lines.extend(values.iter().map(|v| format!("- {v}")));
            lines.join("\n")
        };
        self.result(PolicyOutcome::Noop, actor, "list-blocked", message, Defaults::default())
    }

    fn handle_history(&self, actor: &PolicyActorContext, argv: &[String]) -> PolicyExecutionResult {
        if argv.len() > 1 {
            return self.result(PolicyOutcome::Invalid, actor, "history", "Usage: /policy history [limit]".to_string(), Defaults::default());
        }
        let limit = match argv.first() {
            None => 10usize,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(n) => n.clamp(1, 100) as usize,
                Err(_) => {
                    return self.result(PolicyOutcome::Invalid, actor, "history", "Usage: /policy history [limit]".to_string(), Defaults::default());
                }
            },
        };

        let rows = self.audit.read_recent(limit);
        if rows.is_empty() {
            return self.result(PolicyOutcome::Noop, actor, "history", "Policy history is empty.".to_string(), Defaults::default());
        }

        let mut lines = vec![format!("Policy history: {} (latest first)", rows.len())];
        for row in &rows {
            let mut command = row.command_raw.trim().to_string();
            if command.is_empty() {
                command = "(unknown command)".to_string();
            }
            if command.chars().count() > 80 {
                command = format!("{}...", command.chars().take(77).collect::<String>());
            }
            lines.push(format!("- {} | {} | {} | {}", row.id, row.timestamp, row.result, command));
        }
        lines.push("Use: /policy rollback <change_id> [--confirm]".to_string());
        self.result(PolicyOutcome::Noop, actor, "history", lines.join("\n"), Defaults::default())
    }

    fn handle_rollback(&self, policy: &PolicyConfig, actor: &PolicyActorContext, argv: &[String], options: PolicyExecutionOptions, raw_text: &str) -> PolicyExecutionResult {
        if argv.len() != 1 || argv[0].trim().is_empty() {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "rollback",
                "Usage: /policy rollback <change_id> [--confirm] [--dry-run]".to_string(),
                Defaults { dry_run: options.dry_run, is_rollback: true, ..Default::default() },
            );
        }
        let target_change_id = argv[0].trim();

        let Some(target) = self.audit.find(target_change_id) else {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "rollback",
                format!("Unknown change id: {target_change_id}"),
                Defaults { dry_run: options.dry_run, is_rollback: true, ..Default::default() },
            );
        };
        let Some(backup_ref) = target.backup_ref else {
            return self.result(
                PolicyOutcome::Invalid,
                actor,
                "rollback",
                format!("Change {target_change_id} has no rollback snapshot."),
                Defaults { dry_run: options.dry_run, is_rollback: true, ..Default::default() },
            );
        };

        let restored = match self.audit.load_backup(&backup_ref) {
            Ok(p) => p,
            Err(e) => {
                return self.result(
                    PolicyOutcome::Error,
                    actor,
                    "rollback",
                    format!("Failed to load rollback snapshot: {e}"),
                    Defaults { dry_run: options.dry_run, is_rollback: true, ..Default::default() },
                );
            }
        };

        let result = self.commit_policy(policy, &restored, actor, "rollback", raw_text, options.dry_run, true);
        if result.outcome == PolicyOutcome::Applied {
            let mut r = result;
            r.message = format!("Rollback applied from change {target_change_id}.");
            r
        } else {
            result
        }
    }
}

fn allowed_tools_mode_str(mode: warden_core::AllowedToolsMode) -> &'static str {
    match mode {
        warden_core::AllowedToolsMode::All => "all",
        warden_core::AllowedToolsMode::Allowlist => "allowlist",
    }
}

/// Convenience bag for the many optional fields of [`PolicyExecutionResult`].
#[derive(Default)]
struct Defaults {
    mutated: bool,
    before_hash: Option<String>,
    after_hash: Option<String>,
    audit_id: Option<String>,
    backup_ref: Option<String>,
    dry_run: bool,
    unknown_command: bool,
    audit_write_failed: bool,
    is_rollback: bool,
}
