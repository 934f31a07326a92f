//! All-or-nothing application of unified diffs.
//!
//! A patch is applied in three phases:
//!
//! 1. **Plan**: every file is read and every hunk is located and applied in
//!    memory. Any mismatch rejects the whole patch before the disk is touched.
//! 2. **Stage**: new contents are written to temp files in the workspace root
//!    (same filesystem, so the final rename is atomic per file).
//! 3. **Commit**: temp files are renamed into place and deletions performed.
//!    If a step fails midway, files already committed are restored from the
//!    originals captured in phase 1.
//!
//! Hunks are located at their declared line first and then by fuzzy search
//! (see [`seek`]), so patches produced against a slightly stale view still
//! apply as long as their context lines are intact.

mod parser;
mod seek;

use std::fs::Permissions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::policy::{contain_path, ContainmentError};
use crate::runtime::lock::LOCK_FILE_NAME;

pub use parser::{parse_unified_diff, FilePatch, Hunk, HunkLine, ParseError, PatchKind};

/// Prefix of staging files; excluded from listings and git.
pub const STAGING_PREFIX: &str = ".pdd-patch-";

/// Runtime bookkeeping files at the workspace root that tools never expose
/// or overwrite.
pub(crate) fn is_reserved(root: &Path, path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let at_root = path.parent().is_some_and(|parent| parent == root);
    at_root && (name == LOCK_FILE_NAME || name.starts_with(STAGING_PREFIX))
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("patch does not apply to {path}: {message}")]
    Conflict { path: String, message: String },
    #[error(transparent)]
    Path(#[from] ContainmentError),
    #[error("{0} is reserved by the runtime")]
    Reserved(String),
    #[error("failed to update {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: PatchKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub files_changed: Vec<FileChange>,
    pub summary: String,
    /// Unified diff of what actually changed on disk, for the audit trail.
    pub diff: String,
}

/// One file's fully computed change.
struct PlannedChange {
    rel: String,
    abs: PathBuf,
    kind: PatchKind,
    original: Option<Vec<u8>>,
    /// `None` deletes the file.
    contents: Option<String>,
    permissions: Option<Permissions>,
}

/// Apply `diff` under `root`, or change nothing at all.
///
/// `default_path` names the target for hunks without file headers.
pub fn apply_patch(
    root: &Path,
    diff: &str,
    default_path: Option<&str>,
) -> Result<PatchOutcome, PatchError> {
    let files = parse_unified_diff(diff, default_path)?;

    let mut plan = Vec::with_capacity(files.len());
    for file in &files {
        plan.push(plan_file(root, file)?);
    }

    let staged = stage(root, &plan)?;
    commit(&plan, staged)?;

    let files_changed: Vec<FileChange> = plan
        .iter()
        .map(|change| FileChange {
            path: change.rel.clone(),
            kind: change.kind,
        })
        .collect();
    tracing::debug!(files = files_changed.len(), "patch applied");

    Ok(PatchOutcome {
        summary: build_summary(&files_changed),
        diff: render_diff(&plan),
        files_changed,
    })
}

fn plan_file(root: &Path, file: &FilePatch) -> Result<PlannedChange, PatchError> {
    let abs = contain_path(root, &file.path)?;
    if is_reserved(&contain_path(root, ".")?, &abs) {
        return Err(PatchError::Reserved(file.path.clone()));
    }
    let conflict = |message: String| PatchError::Conflict {
        path: file.path.clone(),
        message,
    };

    if abs.is_dir() {
        return Err(conflict("target is a directory".into()));
    }
    let original = if abs.is_file() {
        Some(std::fs::read(&abs).map_err(|source| PatchError::Io {
            path: file.path.clone(),
            source,
        })?)
    } else {
        None
    };
    let permissions = std::fs::metadata(&abs).ok().map(|m| m.permissions());

    let text = match &original {
        Some(bytes) => Some(
            std::str::from_utf8(bytes)
                .map_err(|_| conflict("file is not valid UTF-8 text".into()))?
                .to_string(),
        ),
        None => None,
    };

    let contents = match (file.kind, text) {
        (PatchKind::Create, Some(_)) => return Err(conflict("file already exists".into())),
        (PatchKind::Create, None) => Some(apply_hunks(&file.path, "", &file.hunks)?),
        (PatchKind::Delete, None) => return Err(conflict("file does not exist".into())),
        (PatchKind::Delete, Some(current)) => {
            let remaining = apply_hunks(&file.path, &current, &file.hunks)?;
            if file.hunks.is_empty() || remaining.is_empty() {
                None
            } else {
                return Err(conflict(
                    "delete patch does not remove the whole file".into(),
                ));
            }
        }
        (PatchKind::Modify, Some(current)) => Some(apply_hunks(&file.path, &current, &file.hunks)?),
        // A headerless patch that only adds lines may target a new file.
        (PatchKind::Modify, None) if file.hunks.iter().all(|h| h.old_len == 0) => {
            Some(apply_hunks(&file.path, "", &file.hunks)?)
        }
        (PatchKind::Modify, None) => return Err(conflict("file does not exist".into())),
    };

    let kind = match (file.kind, &original) {
        (PatchKind::Modify, None) => PatchKind::Create,
        (kind, _) => kind,
    };

    Ok(PlannedChange {
        rel: file.path.clone(),
        abs,
        kind,
        original,
        contents,
        permissions,
    })
}

/// Apply `hunks` to `content` in memory. Hunks must appear in file order and
/// may not overlap.
fn apply_hunks(path: &str, content: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut ends_with_newline = content.is_empty() || content.ends_with('\n');

    let mut output: Vec<String> = Vec::with_capacity(lines.len());
    let mut cursor = 0;

    for (number, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let anchor = hunk.anchor();

        let at_anchor =
            anchor >= cursor && seek::matches_at(&lines, &old, anchor, seek::Tolerance::Exact);
        let position = if at_anchor {
            anchor
        } else {
            let (found, tolerance) = seek::seek_sequence(&lines, &old, cursor, anchor)
                .ok_or_else(|| PatchError::Conflict {
                    path: path.to_string(),
                    message: hunk_mismatch(number + 1, hunk, &old),
                })?;
            if found != anchor || tolerance != seek::Tolerance::Exact {
                tracing::debug!(
                    path,
                    hunk = number + 1,
                    declared = anchor + 1,
                    actual = found + 1,
                    ?tolerance,
                    "hunk applied with offset or fuzz"
                );
            }
            found
        };

        output.extend(lines[cursor..position].iter().cloned());
        let mut file_line = position;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(_) => {
                    output.push(lines[file_line].clone());
                    file_line += 1;
                }
                HunkLine::Remove(_) => file_line += 1,
                HunkLine::Add(text) => output.push(text.clone()),
            }
        }
        cursor = file_line;

        if cursor == lines.len() {
            if hunk.new_missing_newline {
                ends_with_newline = false;
            } else if hunk.old_missing_newline || lines.is_empty() {
                ends_with_newline = true;
            }
        }
    }
    output.extend(lines[cursor..].iter().cloned());

    if output.is_empty() {
        return Ok(String::new());
    }
    let mut result = output.join(eol);
    if ends_with_newline {
        result.push_str(eol);
    }
    Ok(result)
}

fn hunk_mismatch(number: usize, hunk: &Hunk, old: &[&str]) -> String {
    let preview: Vec<&str> = old.iter().copied().take(8).collect();
    format!(
        "hunk #{number} (@@ -{},{} @@, patch line {}) does not match the file. Expected lines:\n{}",
        hunk.old_start,
        hunk.old_len,
        hunk.line_number,
        preview.join("\n")
    )
}

fn stage(root: &Path, plan: &[PlannedChange]) -> Result<Vec<Option<NamedTempFile>>, PatchError> {
    plan.iter()
        .map(|change| {
            let Some(contents) = &change.contents else {
                return Ok(None);
            };
            let io_err = |source| PatchError::Io {
                path: change.rel.clone(),
                source,
            };
            let mut temp = tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(root)
                .map_err(io_err)?;
            temp.write_all(contents.as_bytes()).map_err(io_err)?;
            temp.flush().map_err(io_err)?;
            if let Some(permissions) = &change.permissions {
                std::fs::set_permissions(temp.path(), permissions.clone()).map_err(io_err)?;
            }
            Ok(Some(temp))
        })
        .collect()
}

fn commit(plan: &[PlannedChange], staged: Vec<Option<NamedTempFile>>) -> Result<(), PatchError> {
    let mut created_dirs: Vec<PathBuf> = Vec::new();

    for (index, (change, temp)) in plan.iter().zip(staged).enumerate() {
        let result = match temp {
            Some(temp) => create_parents(&change.abs, &mut created_dirs).and_then(|()| {
                temp.persist(&change.abs)
                    .map(|_| ())
                    .map_err(|error| error.error)
            }),
            None => std::fs::remove_file(&change.abs),
        };

        if let Err(source) = result {
            tracing::warn!(path = %change.rel, "patch commit failed, rolling back: {source}");
            rollback(&plan[..index], &created_dirs);
            return Err(PatchError::Io {
                path: change.rel.clone(),
                source,
            });
        }
    }
    Ok(())
}

/// Record and create missing ancestors of `path`, outermost first.
fn create_parents(path: &Path, created: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut missing = Vec::new();
    let mut cursor = parent;
    while !cursor.exists() {
        missing.push(cursor.to_path_buf());
        match cursor.parent() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    std::fs::create_dir_all(parent)?;
    created.extend(missing.into_iter().rev());
    Ok(())
}

fn rollback(committed: &[PlannedChange], created_dirs: &[PathBuf]) {
    for change in committed.iter().rev() {
        let restored = match &change.original {
            Some(bytes) => std::fs::write(&change.abs, bytes),
            None => std::fs::remove_file(&change.abs),
        };
        if let Err(error) = restored {
            tracing::warn!(path = %change.rel, "failed to restore during rollback: {error}");
        }
    }
    for dir in created_dirs.iter().rev() {
        let _ = std::fs::remove_dir(dir);
    }
}

fn render_diff(plan: &[PlannedChange]) -> String {
    let mut rendered = String::new();
    for change in plan {
        let before = change
            .original
            .as_deref()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        let after = change.contents.as_deref().unwrap_or_default();
        let old_name = if change.original.is_some() {
            format!("a/{}", change.rel)
        } else {
            "/dev/null".to_string()
        };
        let new_name = if change.contents.is_some() {
            format!("b/{}", change.rel)
        } else {
            "/dev/null".to_string()
        };
        let unified = similar::TextDiff::from_lines(&*before, after)
            .unified_diff()
            .context_radius(3)
            .header(&old_name, &new_name)
            .to_string();
        rendered.push_str(&unified);
    }
    rendered
}

fn build_summary(changes: &[FileChange]) -> String {
    let names = |kind: PatchKind| -> Vec<&str> {
        changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.path.as_str())
            .collect()
    };
    let mut parts = Vec::new();
    let added = names(PatchKind::Create);
    if !added.is_empty() {
        parts.push(format!("Added: {}", added.join(", ")));
    }
    let modified = names(PatchKind::Modify);
    if !modified.is_empty() {
        parts.push(format!("Modified: {}", modified.join(", ")));
    }
    let deleted = names(PatchKind::Delete);
    if !deleted.is_empty() {
        parts.push(format!("Deleted: {}", deleted.join(", ")));
    }
    if parts.is_empty() {
        "No changes applied".to_string()
    } else {
        parts.join("; ")
    }
}
