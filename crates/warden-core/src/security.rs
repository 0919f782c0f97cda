use serde::{Deserialize, Serialize};

/// Which of the three security checkpoints produced a `SecurityResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityStage {
    Input,
    Tool,
    Output,
}

/// Severity ranking used to pick the most severe match among several rule
/// hits; ordering matters, `derive(PartialOrd)` relies on declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

/// What the engine decided to do with the content under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAction {
    Allow,
    Sanitize,
    Block,
}

/// Result of a single `SecurityEngine::check_*` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityResult {
    pub stage: SecurityStage,
    pub action: SecurityAction,
    pub severity: Severity,
    /// Rule id that produced this result, or a synthetic failure-mode id
    /// (e.g. `security_error_fail_open`) when the engine itself errored.
    pub rule_id: Option<String>,
    /// Content to use in place of the input when `action == Sanitize`.
    pub sanitized_content: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SecurityResult {
    pub fn allow() -> Self {
        Self {
            stage: SecurityStage::Input,
            action: SecurityAction::Allow,
            severity: Severity::Safe,
            rule_id: None,
            sanitized_content: None,
            reason: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.action, SecurityAction::Block)
    }
}
