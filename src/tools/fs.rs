//! Filesystem tools for reading, writing and listing workspace files.
//!
//! Every path argument is resolved through [`Workspace::contain`] before the
//! filesystem is touched.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::relative_display;
use crate::runtime::workspace::Workspace;
use crate::tools::patch::is_reserved;
use crate::tools::types::ToolError;

pub const MAX_READ_BYTES: u64 = 500_000;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub path: String,
    pub bytes_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub path: String,
    pub entries: Vec<ListEntry>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Existence {
    pub path: String,
    pub exists: bool,
    pub is_file: bool,
    pub is_dir: bool,
}

pub fn read_file(workspace: &Workspace, path: &str) -> Result<FileContent, ToolError> {
    let full = workspace.contain(path)?;
    if !full.exists() {
        return Err(ToolError::FileNotFound(path.to_string()));
    }
    if full.is_dir() {
        return Err(ToolError::InvalidArguments(format!("{path} is a directory")));
    }

    let size = std::fs::metadata(&full)
        .map_err(|e| ToolError::io(path, e))?
        .len();
    if size > MAX_READ_BYTES {
        return Err(ToolError::FileTooLarge {
            path: path.to_string(),
            size,
            limit: MAX_READ_BYTES,
        });
    }

    let bytes = std::fs::read(&full).map_err(|e| ToolError::io(path, e))?;
    Ok(FileContent {
        path: relative_display(&workspace.root_path, &full),
        content: String::from_utf8_lossy(&bytes).into_owned(),
        size,
    })
}

pub fn write_file(
    workspace: &Workspace,
    path: &str,
    content: &str,
) -> Result<WriteOutcome, ToolError> {
    let full = workspace.contain(path)?;
    if is_reserved(&workspace.root_path, &full) {
        return Err(ToolError::InvalidArguments(format!(
            "{path} is reserved by the runtime"
        )));
    }
    if full.is_dir() {
        return Err(ToolError::InvalidArguments(format!("{path} is a directory")));
    }

    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ToolError::io(path, e))?;
    }
    std::fs::write(&full, content).map_err(|e| ToolError::io(path, e))?;

    Ok(WriteOutcome {
        path: relative_display(&workspace.root_path, &full),
        bytes_written: content.len(),
    })
}

/// Depth-bounded listing. `max_depth` 0 lists only the immediate children
/// of `path`; each extra level descends one directory further.
pub fn list_files(
    workspace: &Workspace,
    path: &str,
    max_depth: usize,
    limit: usize,
) -> Result<Listing, ToolError> {
    let full = workspace.contain(path)?;
    if !full.exists() {
        return Err(ToolError::FileNotFound(path.to_string()));
    }
    if !full.is_dir() {
        return Err(ToolError::InvalidArguments(format!(
            "{path} is not a directory"
        )));
    }
    let limit = limit.clamp(1, MAX_LIST_LIMIT);

    let mut entries = Vec::new();
    let mut truncated = false;
    let mut stack: Vec<(PathBuf, usize)> = vec![(full.clone(), 0)];

    'walk: while let Some((dir, depth)) = stack.pop() {
        let mut children: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| ToolError::io(relative_display(&workspace.root_path, &dir), e))?
            .filter_map(Result::ok)
            .collect();
        children.sort_by_key(|entry| entry.file_name());

        for child in children {
            let child_path = child.path();
            let name = child.file_name();
            if name == ".git" || is_reserved(&workspace.root_path, &child_path) {
                continue;
            }
            // Do not follow symlinks out of the workspace.
            let Ok(metadata) = std::fs::symlink_metadata(&child_path) else {
                continue;
            };
            let is_dir = metadata.is_dir();

            if entries.len() >= limit {
                truncated = true;
                break 'walk;
            }
            entries.push(ListEntry {
                path: relative_display(&workspace.root_path, &child_path),
                is_dir,
                size: if is_dir { 0 } else { metadata.len() },
            });

            if is_dir && depth < max_depth {
                stack.push((child_path, depth + 1));
            }
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(Listing {
        path: relative_display(&workspace.root_path, &full),
        entries,
        truncated,
    })
}

pub fn file_exists(workspace: &Workspace, path: &str) -> Result<Existence, ToolError> {
    let full = workspace.contain(path)?;
    Ok(Existence {
        path: relative_display(&workspace.root_path, &full),
        exists: full.exists(),
        is_file: full.is_file(),
        is_dir: full.is_dir(),
    })
}

pub fn make_dir(workspace: &Workspace, path: &str) -> Result<Existence, ToolError> {
    let full = workspace.contain(path)?;
    if full.is_file() {
        return Err(ToolError::InvalidArguments(format!(
            "{path} exists and is a file"
        )));
    }
    std::fs::create_dir_all(&full).map_err(|e| ToolError::io(path, e))?;
    file_exists(workspace, path)
}
