//! Static metadata for every `/policy` subcommand: aliases, mutating/risky
//! flags, usage text, and the slash-command tokenizer.

use warden_core::{Result, WardenError};

use crate::contracts::{PolicyCommand, PolicyExecutionOptions};

/// Static metadata for one subcommand.
pub struct PolicyCommandSpec {
    pub name: &'static str,
    pub mutating: bool,
    pub risky: bool,
    pub usage: &'static str,
}

const SPECS: &[PolicyCommandSpec] = &[
    PolicyCommandSpec { name: "help", mutating: false, risky: false, usage: "/policy help" },
    PolicyCommandSpec { name: "list-groups", mutating: false, risky: false, usage: "/policy list-groups [query]" },
    PolicyCommandSpec { name: "resolve-group", mutating: false, risky: false, usage: "/policy resolve-group <name_or_id>" },
    PolicyCommandSpec { name: "status-group", mutating: false, risky: false, usage: "/policy status-group <chat_id@g.us>" },
    PolicyCommandSpec { name: "explain-group", mutating: false, risky: false, usage: "/policy explain-group <chat_id@g.us>" },
    PolicyCommandSpec { name: "allow-group", mutating: true, risky: false, usage: "/policy allow-group <chat_id@g.us>" },
    PolicyCommandSpec { name: "block-group", mutating: true, risky: false, usage: "/policy block-group <chat_id@g.us>" },
    PolicyCommandSpec {
        name: "set-when",
        mutating: true,
        risky: false,
        usage: "/policy set-when <chat_id@g.us> <all|mention_only|allowed_senders|owner_only|off>",
    },
    PolicyCommandSpec { name: "set-persona", mutating: true, risky: false, usage: "/policy set-persona <chat_id@g.us> <persona_path>" },
    PolicyCommandSpec { name: "clear-persona", mutating: true, risky: false, usage: "/policy clear-persona <chat_id@g.us>" },
    PolicyCommandSpec { name: "block-sender", mutating: true, risky: false, usage: "/policy block-sender <chat_id@g.us> <sender_id>" },
    PolicyCommandSpec { name: "unblock-sender", mutating: true, risky: false, usage: "/policy unblock-sender <chat_id@g.us> <sender_id>" },
    PolicyCommandSpec { name: "list-blocked", mutating: false, risky: false, usage: "/policy list-blocked <chat_id@g.us>" },
    PolicyCommandSpec { name: "history", mutating: false, risky: false, usage: "/policy history [limit]" },
    PolicyCommandSpec {
        name: "rollback",
        mutating: true,
        risky: true,
        usage: "/policy rollback <change_id> [--confirm] [--dry-run]",
    },
];

/// `alias -> canonical name`.
const ALIASES: &[(&str, &str)] = &[
    ("groups", "list-groups"),
    ("resume-group", "allow-group"),
    ("pause-group", "block-group"),
];

#[derive(Default)]
pub struct PolicyCommandRegistry;

impl PolicyCommandRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Tokenizes a raw slash-command line. The first token must be `/policy`.
    pub fn parse_slash_command(&self, raw_text: &str) -> Result<PolicyCommand> {
        let trimmed = raw_text.trim();
        if !trimmed.starts_with('/') {
            return Err(WardenError::InvalidCommand("command must start with '/'".to_string()));
        }
        let tokens = shell_words::split(trimmed)
            .map_err(|e| WardenError::InvalidCommand(format!("unbalanced quotes: {e}")))?;
        let mut iter = tokens.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| WardenError::InvalidCommand("empty command".to_string()))?;
        let namespace = first.trim_start_matches('/').to_string();
        if namespace.is_empty() {
            return Err(WardenError::InvalidCommand("empty namespace".to_string()));
        }
        let subcommand = iter.next().unwrap_or_default();
        let argv: Vec<String> = iter.collect();
        Ok(PolicyCommand {
            namespace,
            subcommand,
            argv,
            raw_text: trimmed.to_string(),
        })
    }

    /// Resolves an alias to its canonical subcommand name (lowercased).
    pub fn normalize_subcommand(&self, subcommand: &str) -> String {
        let lowered = subcommand.trim().to_lowercase();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or(lowered)
    }

    pub fn get_spec(&self, canonical_subcommand: &str) -> Option<&'static PolicyCommandSpec> {
        SPECS.iter().find(|spec| spec.name == canonical_subcommand)
    }

    pub fn is_mutating(&self, canonical_subcommand: &str) -> bool {
        self.get_spec(canonical_subcommand).map(|s| s.mutating).unwrap_or(false)
    }

    pub fn is_risky(&self, canonical_subcommand: &str) -> bool {
        self.get_spec(canonical_subcommand).map(|s| s.risky).unwrap_or(false)
    }

    /// Extracts `--dry-run`/`--confirm` flags from anywhere in `argv`,
    /// merging them into `base`. Returns the remaining positional args.
    pub fn split_options(&self, argv: &[String], base: PolicyExecutionOptions) -> (Vec<String>, PolicyExecutionOptions) {
        let mut options = base;
        let mut positional = Vec::with_capacity(argv.len());
        for arg in argv {
            match arg.as_str() {
                "--dry-run" => options.dry_run = true,
                "--confirm" => options.confirm = true,
                _ => positional.push(arg.clone()),
            }
        }
        (positional, options)
    }

    pub fn usage_lines(&self) -> Vec<String> {
        let mut lines = vec!["Policy admin commands:".to_string()];
        for spec in SPECS {
            lines.push(format!("  {}", spec.usage));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespace_and_subcommand() {
        let registry = PolicyCommandRegistry::new();
        let cmd = registry.parse_slash_command("/policy allow-group g1@g.us --confirm").unwrap();
        assert_eq!(cmd.namespace, "policy");
        assert_eq!(cmd.subcommand, "allow-group");
        assert_eq!(cmd.argv, vec!["g1@g.us".to_string(), "--confirm".to_string()]);
    }

    #[test]
    fn rejects_command_without_leading_slash() {
        let registry = PolicyCommandRegistry::new();
        assert!(registry.parse_slash_command("policy help").is_err());
    }

    #[test]
    fn aliases_resolve_to_canonical_names() {
        let registry = PolicyCommandRegistry::new();
        assert_eq!(registry.normalize_subcommand("groups"), "list-groups");
        assert_eq!(registry.normalize_subcommand("resume-group"), "allow-group");
        assert_eq!(registry.normalize_subcommand("pause-group"), "block-group");
    }

    #[test]
    fn split_options_extracts_flags_from_anywhere() {
        let registry = PolicyCommandRegistry::new();
        let argv = vec!["g1@g.us".to_string(), "--dry-run".to_string(), "extra".to_string()];
        let (positional, opts) = registry.split_options(&argv, PolicyExecutionOptions::default());
        assert_eq!(positional, vec!["g1@g.us".to_string(), "extra".to_string()]);
        assert!(opts.dry_run);
        assert!(!opts.confirm);
    }

    #[test]
    fn rollback_is_mutating_and_risky() {
        let registry = PolicyCommandRegistry::new();
        assert!(registry.is_mutating("rollback"));
        assert!(registry.is_risky("rollback"));
        assert!(!registry.is_risky("allow-group"));
    }
}
