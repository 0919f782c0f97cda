//! Load/save the hot-reloadable `policy.json` document.

use std::fs;
use std::path::Path;

use warden_core::{Result, WardenError};

use crate::schema::PolicyConfig;

/// Loads `policy.json`, falling back to [`PolicyConfig::default`] if the file
/// does not exist yet (first run on a fresh data directory).
pub fn load_policy(path: &Path) -> Result<PolicyConfig> {
    if !path.exists() {
        return Ok(PolicyConfig::default());
    }
    let raw = fs::read_to_string(path)?;
    let policy: PolicyConfig = serde_json::from_str(&raw)?;
    Ok(policy)
}

/// Writes `policy` to `path` atomically: serialize to `{path}.tmp`, then
/// rename over the destination. Readers never observe a half-written file.
pub fn save_policy(policy: &PolicyConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(policy)?;
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path).map_err(WardenError::Io)?;
    Ok(())
}

/// Ensures `policy.json` exists on disk, writing the default document if not.
pub fn ensure_policy_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    save_policy(&PolicyConfig::default(), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_default() {
        let dir = std::env::temp_dir().join(format!("warden-policy-test-{}", std::process::id()));
        let path = dir.join("policy.json");
        let policy = load_policy(&path).unwrap();
        assert_eq!(policy.version, 2);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("warden-policy-roundtrip-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policy.json");
        let policy = PolicyConfig::default();
        save_policy(&policy, &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = load_policy(&path).unwrap();
        assert_eq!(loaded.version, policy.version);
        fs::remove_dir_all(&dir).ok();
    }
}
