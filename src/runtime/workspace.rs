use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{contain_path, ContainmentError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A sandboxed directory tree owned by one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Normalized slug; also the directory name under the base dir.
    pub slug: String,
    /// Canonical absolute root. Never changes once resolved.
    pub root_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// Resolve a model-supplied relative path inside this workspace.
    pub fn contain(&self, relative: &str) -> Result<PathBuf, ContainmentError> {
        contain_path(&self.root_path, relative)
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid workspace slug: {0:?}")]
    InvalidSlug(String),
    #[error("failed to prepare workspace directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("workspace `{slug}` is no longer usable: {reason}")]
    Unavailable { slug: String, reason: String },
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Lookup table from slug to workspace root.
///
/// Roots live at `<base_dir>/<slug>` and are created lazily on first
/// resolution. The table is the only shared registry; callers always pass the
/// resolved [`Workspace`] explicitly afterwards.
pub struct WorkspaceManager {
    base_dir: PathBuf,
    workspaces: DashMap<String, Workspace>,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            workspaces: DashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Return the workspace for `slug`, creating its directory if needed.
    ///
    /// Concurrent callers for the same slug serialize on the map entry, and
    /// `create_dir_all` tolerates a directory that appeared in the meantime,
    /// so racing resolutions always observe the same fully-created root.
    pub fn resolve(&self, slug: &str) -> Result<Workspace, WorkspaceError> {
        let slug = normalize_slug(slug)?;
        if let Some(existing) = self.workspaces.get(&slug) {
            return Ok(existing.clone());
        }

        match self.workspaces.entry(slug.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let root = self.base_dir.join(&slug);
                std::fs::create_dir_all(&root).map_err(|source| WorkspaceError::Io {
                    path: root.clone(),
                    source,
                })?;
                let root_path = root.canonicalize().map_err(|source| WorkspaceError::Io {
                    path: root.clone(),
                    source,
                })?;
                let created_at = std::fs::metadata(&root_path)
                    .and_then(|m| m.created())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                let workspace = Workspace {
                    slug: slug.clone(),
                    root_path,
                    created_at,
                };
                tracing::info!(
                    slug = %slug,
                    root = %workspace.root_path.display(),
                    "workspace resolved"
                );
                entry.insert(workspace.clone());
                Ok(workspace)
            }
        }
    }

    /// Already-resolved workspace, without touching the filesystem.
    pub fn get(&self, slug: &str) -> Option<Workspace> {
        let slug = normalize_slug(slug).ok()?;
        self.workspaces.get(&slug).map(|w| w.clone())
    }

    pub fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.workspaces.iter().map(|w| w.clone()).collect();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        all
    }
}

/// Map a free-form project identifier to a safe directory name.
///
/// Runs of characters outside `[A-Za-z0-9_-]` collapse into a single `_`, and
/// leading or trailing underscores are trimmed.
pub fn normalize_slug(raw: &str) -> Result<String, WorkspaceError> {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            if pending_separator {
                slug.push('_');
                pending_separator = false;
            }
            slug.push(c);
        } else {
            pending_separator = true;
        }
    }
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        return Err(WorkspaceError::InvalidSlug(raw.to_string()));
    }
    Ok(slug)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalizes_slugs() {
        assert_eq!(normalize_slug("demo").unwrap(), "demo");
        assert_eq!(normalize_slug("My Project!").unwrap(), "My_Project");
        assert_eq!(normalize_slug("../../etc").unwrap(), "etc");
        assert_eq!(normalize_slug("a//b..c").unwrap(), "a_b_c");
        assert_eq!(normalize_slug("__x__").unwrap(), "x");
        assert!(matches!(
            normalize_slug("../"),
            Err(WorkspaceError::InvalidSlug(_))
        ));
        assert!(normalize_slug("").is_err());
    }

    #[test]
    fn resolve_creates_root_once() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());

        let first = manager.resolve("demo").unwrap();
        assert!(first.root_path.is_dir());
        assert!(first.root_path.ends_with("demo"));

        std::fs::write(first.root_path.join("keep.txt"), "x").unwrap();
        let second = manager.resolve("demo").unwrap();
        assert_eq!(first, second);
        assert!(second.root_path.join("keep.txt").exists());
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn equivalent_slugs_share_a_root() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());
        let a = manager.resolve("my project").unwrap();
        let b = manager.resolve("my!project").unwrap();
        assert_eq!(a.root_path, b.root_path);
        assert_eq!(manager.get("my project").unwrap().slug, "my_project");
        assert!(manager.get("unknown").is_none());
    }

    #[test]
    fn concurrent_resolution_agrees() {
        let base = tempfile::tempdir().unwrap();
        let manager = Arc::new(WorkspaceManager::new(base.path().join("nested")));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.resolve("race").unwrap())
            })
            .collect();
        let roots: Vec<Workspace> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(roots.windows(2).all(|w| w[0] == w[1]));
        assert!(roots[0].root_path.is_dir());
    }

    #[test]
    fn workspace_contains_paths() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());
        let workspace = manager.resolve("demo").unwrap();

        let inside = workspace.contain("src/app.py").unwrap();
        assert!(inside.starts_with(&workspace.root_path));
        assert!(workspace.contain("../other").is_err());
    }
}
