//! Sender-identity normalization and cross-channel alias expansion.
//!
//! A single human shows up under different raw strings depending on the
//! channel and even the specific event (Telegram `@name` vs bare `name`,
//! WhatsApp JID variants with/without a device suffix or leading `+`). This
//! module folds all of that into a set of normalized tokens so allowlists in
//! `policy.json` can be written once and still match.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

/// A resolved actor identity: a primary display token plus every alias form
/// policy allowlists might plausibly be written against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorIdentity {
    pub primary: String,
    pub aliases: Vec<String>,
}

/// Strips whitespace and a leading `@`, then lowercases. The baseline form
/// every comparison in the policy engine is done against.
pub fn normalize_identity_token(value: &str) -> String {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);
    trimmed.trim().to_lowercase()
}

/// Expands one normalized token into the channel-specific alias forms a
/// sender might also be referred to by.
fn expand_channel_aliases(channel: &str, token: &str) -> Vec<String> {
    let mut out = vec![token.to_string()];
    if token.is_empty() {
        return out;
    }

    match channel {
        "telegram" => {
            let all_digits = token.chars().all(|c| c.is_ascii_digit());
            if !all_digits {
                out.push(format!("@{token}"));
            }
        }
        "whatsapp" => {
            let (left, right) = match token.split_once('@') {
                Some((l, r)) => (l, Some(r)),
                None => (token, None),
            };
            let left_base = left.split_once(':').map(|(base, _)| base).unwrap_or(left);
            out.push(left_base.to_string());
            if let Some(right) = right {
                out.push(format!("{left_base}@{right}"));
            }
            if let Some(stripped) = left_base.strip_prefix('+') {
                out.push(stripped.to_string());
            } else if left_base.chars().all(|c| c.is_ascii_digit()) && !left_base.is_empty() {
                out.push(format!("+{left_base}"));
            }
        }
        _ => {}
    }

    out
}

/// Normalizes a whole allowlist (policy.json `senders` array) into the set of
/// tokens an incoming actor's normalized aliases are checked against.
pub fn normalize_sender_list(channel: &str, values: &[String]) -> HashSet<String> {
    let mut set = HashSet::new();
    for value in values {
        let base = normalize_identity_token(value);
        if base.is_empty() {
            continue;
        }
        for alias in expand_channel_aliases(channel, &base) {
            set.insert(alias);
        }
    }
    set
}

fn split_sender_id(sender_id: &str) -> Vec<&str> {
    sender_id.split('|').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Builds the full alias set for one inbound event's sender, combining the
/// pipe-delimited `sender_id` with any of a fixed set of metadata keys a
/// channel adapter might have stashed (`user_id`, `username`, `sender`, `pn`,
/// `sender_id`).
pub fn resolve_actor_identity(
    channel: &str,
    sender_id: &str,
    metadata: &BTreeMap<String, Value>,
) -> ActorIdentity {
    let mut candidates: Vec<String> = split_sender_id(sender_id).into_iter().map(String::from).collect();

    for key in ["user_id", "username", "sender", "pn", "sender_id"] {
        if let Some(Value::String(s)) = metadata.get(key) {
            let s = s.trim();
            if !s.is_empty() {
                candidates.push(s.to_string());
            }
        }
    }

    let mut seen = HashSet::new();
    let mut aliases = Vec::new();
    for candidate in candidates {
        let base = normalize_identity_token(&candidate);
        if base.is_empty() {
            continue;
        }
        let mut expanded = expand_channel_aliases(channel, &base);
        expanded.sort();
        for alias in expanded {
            if seen.insert(alias.clone()) {
                aliases.push(alias);
            }
        }
    }

    let primary = aliases.first().cloned().unwrap_or_default();
    ActorIdentity { primary, aliases }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_at_and_case() {
        assert_eq!(normalize_identity_token("  @Alice "), "alice");
    }

    #[test]
    fn telegram_alias_adds_at_prefix_for_non_numeric() {
        let set = normalize_sender_list("telegram", &["alice".to_string()]);
        assert!(set.contains("alice"));
        assert!(set.contains("@alice"));
    }

    #[test]
    fn telegram_numeric_id_has_no_at_alias() {
        let set = normalize_sender_list("telegram", &["12345".to_string()]);
        assert!(set.contains("12345"));
        assert!(!set.contains("@12345"));
    }

    #[test]
    fn whatsapp_jid_variants_expand() {
        let set = normalize_sender_list("whatsapp", &["123:1@s.whatsapp.net".to_string()]);
        assert!(set.contains("123:1@s.whatsapp.net"));
        assert!(set.contains("123"));
        assert!(set.contains("123@s.whatsapp.net"));
        assert!(set.contains("+123"));
    }

    #[test]
    fn whatsapp_plus_prefixed_number_toggles() {
        let set = normalize_sender_list("whatsapp", &["+49170".to_string()]);
        assert!(set.contains("+49170"));
        assert!(set.contains("49170"));
    }

    #[test]
    fn resolve_actor_identity_merges_sender_id_and_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("username".to_string(), Value::String("Bob".to_string()));
        let identity = resolve_actor_identity("telegram", "999|bob", &metadata);
        assert!(identity.aliases.contains(&"999".to_string()));
        assert!(identity.aliases.contains(&"bob".to_string()));
        assert!(identity.aliases.contains(&"@bob".to_string()));
        assert!(!identity.primary.is_empty());
    }
}
