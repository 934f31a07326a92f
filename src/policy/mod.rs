//! Sandbox policy for workspace access.
//!
//! Two checks live here and every tool goes through them:
//! - [`contain_path`] maps a model-supplied relative path onto the workspace
//!   root and refuses anything that would resolve outside of it.
//! - [`CommandPolicy`] decides which programs may be spawned at all.

mod command;

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use command::{
    blocked_shell_token, split_command_line, CommandPolicy, BLOCKED_SHELL_TOKENS,
    DEFAULT_ALLOWED_COMMANDS,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Reasons a relative path was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainmentError {
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("path escapes workspace: {0}")]
    Traversal(String),
    #[error("path resolves outside the workspace through a symlink: {0}")]
    SymlinkEscape(String),
    #[error("invalid path: {0}")]
    Invalid(String),
    #[error("workspace root unavailable at {root}: {reason}")]
    RootUnavailable { root: String, reason: String },
}

impl ContainmentError {
    /// True for the variants caused by the requested path, as opposed to a
    /// broken workspace root.
    pub fn is_escape(&self) -> bool {
        !matches!(self, ContainmentError::RootUnavailable { .. })
    }
}

/// Resolve `relative` against `root`, refusing any result that is not `root`
/// itself or a descendant of it.
///
/// `..` segments are folded lexically first; a segment that would climb above
/// the root is rejected outright. The deepest existing ancestor of the result
/// is then canonicalized so symlinks are followed before the containment
/// check. Components that do not exist yet are appended unchanged, which lets
/// callers create new files.
pub fn contain_path(root: &Path, relative: &str) -> Result<PathBuf, ContainmentError> {
    let trimmed = relative.trim();
    let requested = if trimmed.is_empty() { "." } else { trimmed };

    if requested.contains('\0') {
        return Err(ContainmentError::Invalid(requested.replace('\0', "\\0")));
    }
    if requested.starts_with('/') || requested.starts_with('\\') || requested.contains(':') {
        return Err(ContainmentError::Absolute(requested.to_string()));
    }

    let root = root
        .canonicalize()
        .map_err(|e| ContainmentError::RootUnavailable {
            root: root.display().to_string(),
            reason: e.to_string(),
        })?;

    let mut normalized = PathBuf::new();
    for component in Path::new(requested).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ContainmentError::Traversal(requested.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ContainmentError::Absolute(requested.to_string()));
            }
        }
    }

    let joined = root.join(&normalized);

    // Walk up to the deepest component that exists on disk (a dangling
    // symlink counts as existing and fails canonicalization below).
    let mut existing = joined.clone();
    let mut missing: Vec<OsString> = Vec::new();
    while std::fs::symlink_metadata(&existing).is_err() {
        let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
            break;
        };
        missing.push(name);
        if !existing.pop() {
            break;
        }
    }

    let resolved = existing
        .canonicalize()
        .map_err(|_| ContainmentError::SymlinkEscape(requested.to_string()))?;
    if !resolved.starts_with(&root) {
        return Err(ContainmentError::SymlinkEscape(requested.to_string()));
    }

    let mut contained = resolved;
    for part in missing.iter().rev() {
        contained.push(part);
    }
    Ok(contained)
}

/// Workspace-relative display form of a contained path, using `/` separators.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let relative = path
        .strip_prefix(&canonical_root)
        .or_else(|_| path.strip_prefix(root))
        .unwrap_or(path);
    let text = relative.to_string_lossy().replace('\\', "/");
    if text.is_empty() {
        ".".to_string()
    } else {
        text
    }
}
