//! Persona-file resolution, confined to the configured workspace directory.

use std::path::{Path, PathBuf};

use tracing::warn;
use warden_core::{Result, WardenError};

/// Resolves `persona_file` to an absolute path inside `workspace`.
///
/// A relative path is joined under the workspace; an absolute path is used
/// as-is but must still land inside the workspace after resolution. Either
/// way, escaping the workspace (e.g. via `../../etc/passwd`) is rejected —
/// this is the one hard security invariant of the policy layer's file I/O.
pub fn resolve_persona_path(persona_file: &str, workspace: &Path) -> Result<PathBuf> {
    let workspace_resolved = resolve_dir(workspace)?;

    let raw = PathBuf::from(shellexpand_home(persona_file));
    let candidate = if raw.is_absolute() {
        raw
    } else {
        workspace_resolved.join(raw)
    };

    let resolved = lexical_normalize(&candidate);
    if !resolved.starts_with(&workspace_resolved) {
        return Err(WardenError::PolicyValidation {
            field: "personaFile".to_string(),
            reason: format!("Persona file must be inside workspace: {persona_file}"),
        });
    }
    Ok(resolved)
}

/// Loads the persona text, returning `None` (with a warning logged) if the
/// file is missing, unreadable, or not a regular file.
pub fn load_persona_text(persona_file: Option<&str>, workspace: &Path) -> Option<String> {
    let persona_file = persona_file?;
    if persona_file.trim().is_empty() {
        return None;
    }
    let path = match resolve_persona_path(persona_file, workspace) {
        Ok(p) => p,
        Err(err) => {
            warn!(persona_file, error = %err, "persona path rejected");
            return None;
        }
    };
    if !path.is_file() {
        warn!(path = %path.display(), "persona file missing or not a regular file");
        return None;
    }
    match std::fs::read_to_string(&path) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read persona file");
            None
        }
    }
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn resolve_dir(dir: &Path) -> Result<PathBuf> {
    let expanded = PathBuf::from(shellexpand_home(&dir.to_string_lossy()));
    Ok(lexical_normalize(&expanded))
}

/// Lexically normalizes `.`/`..` components without requiring the path to
/// exist on disk (unlike `Path::canonicalize`, which the policy workspace
/// may not have been created yet when this runs during validation).
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_persona_resolves_inside_workspace() {
        let workspace = PathBuf::from("/home/user/.warden");
        let resolved = resolve_persona_path("personas/default.md", &workspace).unwrap();
        assert_eq!(resolved, PathBuf::from("/home/user/.warden/personas/default.md"));
    }

    #[test]
    fn escaping_workspace_is_rejected() {
        let workspace = PathBuf::from("/home/user/.warden");
        let err = resolve_persona_path("../../etc/passwd", &workspace).unwrap_err();
        assert!(matches!(err, WardenError::PolicyValidation { .. }));
    }

    #[test]
    fn absolute_path_outside_workspace_is_rejected() {
        let workspace = PathBuf::from("/home/user/.warden");
        let err = resolve_persona_path("/etc/passwd", &workspace).unwrap_err();
        assert!(matches!(err, WardenError::PolicyValidation { .. }));
    }
}
