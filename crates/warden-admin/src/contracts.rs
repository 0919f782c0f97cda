//! Shared request/response shapes for the policy admin command surface.

use std::collections::BTreeMap;

/// Where a policy command originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorSource {
    Dm,
    Cli,
}

impl ActorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorSource::Dm => "dm",
            ActorSource::Cli => "cli",
        }
    }
}

/// Who issued a policy command, and from where.
#[derive(Debug, Clone)]
pub struct PolicyActorContext {
    pub source: ActorSource,
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub is_group: bool,
    pub is_owner: bool,
}

impl PolicyActorContext {
    pub fn cli(sender_id: impl Into<String>) -> Self {
        Self {
            source: ActorSource::Cli,
            channel: "cli".to_string(),
            chat_id: "cli".to_string(),
            sender_id: sender_id.into(),
            is_group: false,
            is_owner: true,
        }
    }
}

/// A parsed `/policy ...` command line.
#[derive(Debug, Clone)]
pub struct PolicyCommand {
    pub namespace: String,
    pub subcommand: String,
    pub argv: Vec<String>,
    pub raw_text: String,
}

/// Flags trailing a command line (`--dry-run`, `--confirm`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyExecutionOptions {
    pub dry_run: bool,
    pub confirm: bool,
}

/// Terminal status of one executed (or rejected) policy command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    Applied,
    Noop,
    Denied,
    Invalid,
    Error,
}

impl PolicyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyOutcome::Applied => "applied",
            PolicyOutcome::Noop => "noop",
            PolicyOutcome::Denied => "denied",
            PolicyOutcome::Invalid => "invalid",
            PolicyOutcome::Error => "error",
        }
    }
}

/// Result of executing (or attempting to execute) one policy command.
#[derive(Debug, Clone)]
pub struct PolicyExecutionResult {
    pub outcome: PolicyOutcome,
    pub message: String,
    pub mutated: bool,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
    pub audit_id: Option<String>,
    pub backup_ref: Option<String>,
    pub command_name: String,
    pub source: ActorSource,
    pub dry_run: bool,
    pub unknown_command: bool,
    pub audit_write_failed: bool,
    pub is_rollback: bool,
    pub meta: BTreeMap<String, String>,
}
