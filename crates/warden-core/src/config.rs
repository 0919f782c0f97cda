use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

/// Fail-mode governing security-stage behaviour when a rule evaluation panics
/// or otherwise errors out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityFailMode {
    Open,
    Closed,
    Mixed,
}

impl Default for SecurityFailMode {
    fn default() -> Self {
        SecurityFailMode::Mixed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStagesConfig {
    #[serde(default = "bool_true")]
    pub input: bool,
    #[serde(default = "bool_true")]
    pub tool: bool,
    #[serde(default = "bool_true")]
    pub output: bool,
}

impl Default for SecurityStagesConfig {
    fn default() -> Self {
        Self {
            input: true,
            tool: true,
            output: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub stages: SecurityStagesConfig,
    #[serde(default)]
    pub fail_mode: SecurityFailMode,
    #[serde(default = "default_redact_placeholder")]
    pub redact_placeholder: String,
    #[serde(default = "default_block_user_message")]
    pub block_user_message: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stages: SecurityStagesConfig::default(),
            fail_mode: SecurityFailMode::default(),
            redact_placeholder: default_redact_placeholder(),
            block_user_message: default_block_user_message(),
        }
    }
}

/// Tuning knobs for the middleware pipeline itself — timings, window sizes,
/// and user-facing strings that aren't policy data (they apply uniformly
/// regardless of which chat/channel is involved).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,
    #[serde(default = "default_reply_context_window_limit")]
    pub reply_context_window_limit: usize,
    #[serde(default = "default_reply_context_line_max_chars")]
    pub reply_context_line_max_chars: usize,
    #[serde(default = "default_ambient_window_limit")]
    pub ambient_window_limit: usize,
    #[serde(default = "default_input_block_emoji")]
    pub input_block_emoji: String,
    #[serde(default = "default_owner_alert_cooldown_seconds")]
    pub owner_alert_cooldown_seconds: u64,
    #[serde(default = "default_tts_max_raw_bytes")]
    pub tts_max_raw_bytes: usize,
    #[serde(default = "default_seen_chats_path")]
    pub seen_chats_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
            reply_context_window_limit: default_reply_context_window_limit(),
            reply_context_line_max_chars: default_reply_context_line_max_chars(),
            ambient_window_limit: default_ambient_window_limit(),
            input_block_emoji: default_input_block_emoji(),
            owner_alert_cooldown_seconds: default_owner_alert_cooldown_seconds(),
            tts_max_raw_bytes: default_tts_max_raw_bytes(),
            seen_chats_path: default_seen_chats_path(),
        }
    }
}

fn default_dedup_ttl_seconds() -> u64 {
    20 * 60
}
fn default_reply_context_window_limit() -> usize {
    6
}
fn default_reply_context_line_max_chars() -> usize {
    500
}
fn default_ambient_window_limit() -> usize {
    8
}
fn default_input_block_emoji() -> String {
    "\u{1F602}".to_string()
}
fn default_owner_alert_cooldown_seconds() -> u64 {
    300
}
fn default_tts_max_raw_bytes() -> usize {
    160 * 1024
}
fn default_seen_chats_path() -> String {
    format!("{}/seen_chats.json", data_dir_root())
}

/// Ambient, process-wide configuration for the orchestration core.
///
/// Distinct from the hot-reloadable policy document: this is read once at
/// startup from `warden.toml` (plus `WARDEN_*` env overrides) and never
/// changes for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub policy: PolicyFileConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            policy: PolicyFileConfig::default(),
            security: SecurityConfig::default(),
            archive: ArchiveConfig::default(),
            bus: BusConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub dir: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFileConfig {
    #[serde(default = "default_policy_path")]
    pub path: String,
    #[serde(default = "default_workspace_dir")]
    pub workspace: String,
    /// Channels the policy engine is actively applied to. Channels outside
    /// this set get the `policy_not_applied` allow-all decision.
    #[serde(default = "default_apply_channels")]
    pub apply_channels: Vec<String>,
    #[serde(default = "default_reload_interval")]
    pub reload_check_interval_seconds: f64,
}

impl Default for PolicyFileConfig {
    fn default() -> Self {
        Self {
            path: default_policy_path(),
            workspace: default_workspace_dir(),
            apply_channels: default_apply_channels(),
            reload_check_interval_seconds: default_reload_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_path")]
    pub path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub reaction_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            reaction_capacity: default_queue_capacity(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_redact_placeholder() -> String {
    "[REDACTED]".to_string()
}
fn default_block_user_message() -> String {
    "I can't share that.".to_string()
}
fn default_queue_capacity() -> usize {
    256
}
fn default_retention_days() -> i64 {
    30
}
fn default_reload_interval() -> f64 {
    1.0
}
fn default_apply_channels() -> Vec<String> {
    vec!["whatsapp".to_string(), "telegram".to_string()]
}

/// Resolves the data directory root, honoring the `HOME_DIR_OVERRIDE` env var
/// documented as the only environment input the core itself consumes.
pub fn data_dir_root() -> String {
    if let Ok(dir) = std::env::var("HOME_DIR_OVERRIDE") {
        return dir;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.warden", home)
}

fn default_data_dir() -> String {
    data_dir_root()
}
fn default_policy_path() -> String {
    format!("{}/policy.json", data_dir_root())
}
fn default_workspace_dir() -> String {
    data_dir_root()
}
fn default_archive_path() -> String {
    format!("{}/archive.db", data_dir_root())
}

impl WardenConfig {
    /// Load config from `warden.toml` with `WARDEN_*` env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: WardenConfig = Figment::from(figment::providers::Serialized::defaults(
            WardenConfig::default(),
        ))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("WARDEN_").split("_"))
        .extract()
        .map_err(|e| WardenError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.dir)
    }

    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(&self.policy.workspace)
    }
}

fn default_config_path() -> String {
    format!("{}/warden.toml", data_dir_root())
}
