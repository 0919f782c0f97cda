//! Append-only audit journal and policy backup snapshots for admin mutations.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use warden_core::{Result, WardenError};
use warden_policy::{load_policy, PolicyConfig};

/// One row of the append-only `policy_changes.jsonl` journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAuditEntry {
    pub id: String,
    pub timestamp: String,
    pub actor_source: String,
    pub actor_id: String,
    pub channel: String,
    pub chat_id: String,
    pub command_raw: String,
    pub dry_run: bool,
    pub result: String,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
    pub backup_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Owns `policy/audit/policy_changes.jsonl` and `policy/audit/backups/`,
/// both rooted next to the policy file itself.
pub struct PolicyAuditStore {
    root: PathBuf,
    history_path: PathBuf,
    backup_dir: PathBuf,
}

impl PolicyAuditStore {
    pub fn new(policy_path: &Path) -> Self {
        let root = policy_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("policy")
            .join("audit");
        Self {
            history_path: root.join("policy_changes.jsonl"),
            backup_dir: root.join("backups"),
            root,
        }
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.backup_dir)?;
        Ok(())
    }

    /// Deterministic content hash: sorted-key JSON (serde_json's default map
    /// representation is a `BTreeMap`, so this is already canonical) through
    /// SHA-256.
    pub fn policy_hash(policy: &PolicyConfig) -> Result<String> {
        let payload = serde_json::to_vec(policy)?;
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn write_backup(&self, change_id: &str, before_policy: &PolicyConfig) -> Result<String> {
        self.ensure_dirs()?;
        let rel = format!("backups/{change_id}.json");
        let path = self.root.join(&rel);
        let body = serde_json::to_string_pretty(before_policy)?;
        fs::write(&path, body)?;
        Ok(rel)
    }

    pub fn load_backup(&self, backup_ref: &str) -> Result<PolicyConfig> {
        load_policy(&self.root.join(backup_ref))
    }

    pub fn append(&self, entry: &PolicyAuditEntry) -> Result<()> {
        self.ensure_dirs()?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.history_path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}").map_err(WardenError::Io)?;
        Ok(())
    }

    fn read_all(&self) -> Vec<PolicyAuditEntry> {
        let Ok(raw) = fs::read_to_string(&self.history_path) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<PolicyAuditEntry>(line).ok())
            .collect()
    }

    /// Last `limit` rows, most recent first.
    pub fn read_recent(&self, limit: usize) -> Vec<PolicyAuditEntry> {
        if limit == 0 {
            return Vec::new();
        }
        let mut rows = self.read_all();
        if rows.len() > limit {
            rows = rows.split_off(rows.len() - limit);
        }
        rows.reverse();
        rows
    }

    pub fn find(&self, change_id: &str) -> Option<PolicyAuditEntry> {
        self.read_all().into_iter().find(|row| row.id == change_id)
    }

    pub fn now_iso() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(id: &str, result: &str) -> PolicyAuditEntry {
        PolicyAuditEntry {
            id: id.to_string(),
            timestamp: PolicyAuditStore::now_iso(),
            actor_source: "dm".to_string(),
            actor_id: "owner".to_string(),
            channel: "whatsapp".to_string(),
            chat_id: "dm".to_string(),
            command_raw: "/policy allow-group g1@g.us".to_string(),
            dry_run: false,
            result: result.to_string(),
            before_hash: Some("before".to_string()),
            after_hash: Some("after".to_string()),
            backup_ref: Some("backups/abc.json".to_string()),
            error: None,
        }
    }

    #[test]
    fn append_and_read_recent_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.json");
        let store = PolicyAuditStore::new(&policy_path);
        store.append(&sample_entry("a1", "applied")).unwrap();
        store.append(&sample_entry("a2", "applied")).unwrap();

        let recent = store.read_recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "a2");
        assert_eq!(recent[1].id, "a1");
    }

    #[test]
    fn find_locates_entry_by_change_id() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.json");
        let store = PolicyAuditStore::new(&policy_path);
        store.append(&sample_entry("a1", "applied")).unwrap();
        assert!(store.find("a1").is_some());
        assert!(store.find("missing").is_none());
    }

    #[test]
    fn write_and_load_backup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.json");
        let store = PolicyAuditStore::new(&policy_path);
        let policy = PolicyConfig::default();
        let rel = store.write_backup("c1", &policy).unwrap();
        let restored = store.load_backup(&rel).unwrap();
        assert_eq!(restored.version, policy.version);
    }

    #[test]
    fn policy_hash_is_stable_for_equivalent_documents() {
        let a = PolicyConfig::default();
        let b = PolicyConfig::default();
        assert_eq!(PolicyAuditStore::policy_hash(&a).unwrap(), PolicyAuditStore::policy_hash(&b).unwrap());
    }
}
