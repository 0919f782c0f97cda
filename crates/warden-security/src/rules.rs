use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use warden_core::{SecurityAction, SecurityResult, SecurityStage, Severity};

use crate::normalize::{normalize_text, NormalizedText};

struct RuleHit {
    rule_id: &'static str,
    severity: Severity,
    reason: &'static str,
}

fn ci(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).expect("static security pattern must compile")
}

static INPUT_OVERRIDE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        ci(r"\b(ignore|forget|disregard)\b.{0,30}\b(instruction|system|rule)s?\b"),
        ci(r"\b(jailbreak|dan mode|developer mode)\b"),
    ]
});

static INPUT_EXFIL: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        ci(r"\b(api\s*key|token|secret|credential)s?\b.{0,40}\b(show|print|dump|reveal|leak|export)\b"),
        ci(r"\b(cat|read|print)\b.{0,20}\b(\.env|id_rsa|authorized_keys|/etc/passwd|/etc/shadow)\b"),
    ]
});

static INPUT_TOOL_ABUSE: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        ci(r"\b(always\s+allow|auto\s*approve|skip\s+approval|no\s+approval)\b"),
        ci(r"\b(curl|wget)\b.{0,20}\|\s*(bash|sh)\b"),
    ]
});

static INPUT_WARN: Lazy<Vec<Regex>> =
    Lazy::new(|| vec![ci(r"\b(bypass|override)\b.{0,20}\b(safety|security|guardrail)s?\b")]);

static PERSONA_MANIPULATION: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        ci(r"\b(anrede|addressierung|titel|nickname|称呼)\b"),
        ci(r"(nenn|sag|addressier|call me|称呼).{0,20}(mich|me|dir)\b"),
        ci(r"bitte.{0,30}(änder|change|änderung|addressier)\b"),
        ci(r"(Daddy|Sturmbann|Oberst|Herr|Führer|chef|boss)\b"),
        ci(r"ich bin.{0,20}(dein|deine).{0,20}(owner|herr|chef)\b"),
        ci(r"\bnenn mich\b"),
        ci(r"\bsag zu mir\b"),
        ci(r"wie sollst du.{0,20}(mich|mir|dich){0,20}(nennen|addressieren|anreden)\b"),
    ]
});

static CONFIG_FILE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        ci(r"SOUL\.md"),
        ci(r"AGENTS\.md"),
        ci(r"USER\.md"),
        ci(r"IDENTITY\.md"),
        ci(r"TOOLS\.md"),
        ci(r"SKILL\.md"),
        Regex::new(r"\.warden/").unwrap(),
        Regex::new(r"workspace/memory").unwrap(),
        ci(r"workspace/SOUL"),
    ]
});

static SENSITIVE_PATH: Lazy<Regex> = Lazy::new(|| {
    ci(r"(\.env\b|id_rsa\b|id_ed25519\b|authorized_keys\b|/etc/passwd\b|/etc/shadow\b|\.ssh/|\.aws/)")
});

static EXEC_BLOCK: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        ci(r"\b(rm\s+-[rf]{1,2}\b|mkfs\b|format\b|dd\s+if=|: \(\)\s*\{)"),
        ci(r"\b(curl|wget)\b.{0,25}\|\s*(bash|sh)\b"),
        ci(r"\b(cat|print|grep)\b.{0,25}\b(\.env|id_rsa|authorized_keys|/etc/shadow)\b"),
    ]
});

static EXEC_WARN: Lazy<Vec<Regex>> =
    Lazy::new(|| vec![ci(r"\b(chmod\s+777|sudo\b|--privileged\b)\b")]);

static SPAWN_BLOCK: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        ci(r"\b(ignore|override)\b.{0,40}\b(instruction|safety|guardrail)\b"),
        ci(r"\b(exfiltrate|steal|leak)\b"),
    ]
});

static OUTPUT_SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"sk-[a-zA-Z0-9]{20,}").unwrap(),
        Regex::new(r"sk-proj-[a-zA-Z0-9\-_]{20,}").unwrap(),
        Regex::new(r"AKIA[0-9A-Z]{16}").unwrap(),
        Regex::new(r"ghp_[a-zA-Z0-9]{20,}").unwrap(),
        Regex::new(r"bot\d{8,10}:[a-zA-Z0-9_-]{20,}").unwrap(),
        ci(r"Bearer\s+[A-Za-z0-9\-._~+/]+=*"),
        Regex::new(
            r"(?s)-----BEGIN (?:RSA |EC |OPENSSH )?PRIVATE KEY-----.*?-----END (?:RSA |EC |OPENSSH )?PRIVATE KEY-----",
        )
        .unwrap(),
    ]
});

fn match_any(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

fn hits_for_input(norm: &NormalizedText) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    if match_any(&INPUT_OVERRIDE, &norm.lowered) || match_any(&INPUT_OVERRIDE, &norm.compact) {
        hits.push(RuleHit {
            rule_id: "instruction_override",
            severity: Severity::High,
            reason: "Instruction override/jailbreak pattern",
        });
    }
    if match_any(&INPUT_EXFIL, &norm.lowered) {
        hits.push(RuleHit {
            rule_id: "secret_exfiltration",
            severity: Severity::Critical,
            reason: "Secret or credential exfiltration attempt",
        });
    }
    if match_any(&INPUT_TOOL_ABUSE, &norm.lowered) {
        hits.push(RuleHit {
            rule_id: "tool_abuse",
            severity: Severity::High,
            reason: "Tool approval bypass pattern",
        });
    }
    if match_any(&INPUT_WARN, &norm.lowered) {
        hits.push(RuleHit {
            rule_id: "safety_bypass_signal",
            severity: Severity::Medium,
            reason: "Suspicious safety-bypass phrasing",
        });
    }
    if match_any(&PERSONA_MANIPULATION, &norm.lowered) {
        hits.push(RuleHit {
            rule_id: "persona_manipulation",
            severity: Severity::High,
            reason: "Persona/address manipulation attempt detected",
        });
    }
    hits
}

pub fn decide_input(text: &str) -> SecurityResult {
    let norm = normalize_text(text);
    let hits = hits_for_input(&norm);
    let Some(top) = hits.iter().max_by_key(|h| h.severity) else {
        return SecurityResult {
            stage: SecurityStage::Input,
            action: SecurityAction::Allow,
            severity: Severity::Safe,
            rule_id: Some("no_match".to_string()),
            sanitized_content: None,
            reason: None,
        };
    };
    let action = if matches!(top.severity, Severity::Critical | Severity::High) {
        SecurityAction::Block
    } else {
        SecurityAction::Sanitize
    };
    SecurityResult {
        stage: SecurityStage::Input,
        action,
        severity: top.severity,
        rule_id: Some(top.rule_id.to_string()),
        sanitized_content: None,
        reason: Some(top.reason.to_string()),
    }
}

fn value_to_lower_string(args: &BTreeMap<String, Value>) -> String {
    serde_json::to_string(args).unwrap_or_default().to_lowercase()
}

pub fn decide_tool(tool_name: &str, args: &BTreeMap<String, Value>) -> SecurityResult {
    let lowered = value_to_lower_string(args);

    if SENSITIVE_PATH.is_match(&lowered)
        && matches!(tool_name, "read_file" | "write_file" | "edit_file" | "exec")
    {
        return SecurityResult {
            stage: SecurityStage::Tool,
            action: SecurityAction::Block,
            severity: Severity::Critical,
            rule_id: Some("sensitive_path".to_string()),
            sanitized_content: None,
            reason: Some("Sensitive path access blocked".to_string()),
        };
    }

    if tool_name == "exec" {
        if match_any(&EXEC_BLOCK, &lowered) {
            return SecurityResult {
                stage: SecurityStage::Tool,
                action: SecurityAction::Block,
                severity: Severity::Critical,
                rule_id: Some("exec_high_risk".to_string()),
                sanitized_content: None,
                reason: Some("High-risk exec command blocked".to_string()),
            };
        }
        if match_any(&EXEC_WARN, &lowered) {
            return SecurityResult {
                stage: SecurityStage::Tool,
                action: SecurityAction::Sanitize,
                severity: Severity::Medium,
                rule_id: Some("exec_warn".to_string()),
                sanitized_content: None,
                reason: Some("Potentially risky exec command".to_string()),
            };
        }
    }

    if tool_name == "spawn" && match_any(&SPAWN_BLOCK, &lowered) {
        return SecurityResult {
            stage: SecurityStage::Tool,
            action: SecurityAction::Block,
            severity: Severity::High,
            rule_id: Some("spawn_abuse".to_string()),
            sanitized_content: None,
            reason: Some("Unsafe subagent task request blocked".to_string()),
        };
    }

    if matches!(tool_name, "write_file" | "edit_file") {
        let content = args
            .get("content")
            .or_else(|| args.get("new_text"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        if match_any(&INPUT_EXFIL, &content) {
            return SecurityResult {
                stage: SecurityStage::Tool,
                action: SecurityAction::Sanitize,
                severity: Severity::Medium,
                rule_id: Some("file_secret_pattern".to_string()),
                sanitized_content: None,
                reason: Some("Potential secret leakage pattern in file content".to_string()),
            };
        }
    }

    SecurityResult {
        stage: SecurityStage::Tool,
        action: SecurityAction::Allow,
        severity: Severity::Safe,
        rule_id: Some("no_match".to_string()),
        sanitized_content: None,
        reason: None,
    }
}

pub fn decide_output(text: &str, redact_placeholder: &str) -> SecurityResult {
    let mut sanitized = text.to_string();
    let mut hit_count = 0usize;

    for pattern in OUTPUT_SECRET_PATTERNS.iter() {
        if pattern.is_match(&sanitized) {
            hit_count += pattern.find_iter(&sanitized.clone()).count();
            sanitized = pattern.replace_all(&sanitized, redact_placeholder).to_string();
        }
    }

    for pattern in CONFIG_FILE_PATTERNS.iter() {
        if pattern.is_match(&sanitized) {
            hit_count += 1;
            sanitized = pattern.replace_all(&sanitized, "internal configuration").to_string();
        }
    }

    if hit_count == 0 {
        return SecurityResult {
            stage: SecurityStage::Output,
            action: SecurityAction::Allow,
            severity: Severity::Safe,
            rule_id: Some("no_match".to_string()),
            sanitized_content: None,
            reason: None,
        };
    }

    SecurityResult {
        stage: SecurityStage::Output,
        action: SecurityAction::Sanitize,
        severity: Severity::High,
        rule_id: Some("output_redaction".to_string()),
        sanitized_content: Some(sanitized),
        reason: Some("Sensitive token or config file pattern detected in output".to_string()),
    }
}
