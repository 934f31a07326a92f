//! Plain-substring text search across a workspace.
//!
//! Uses `ignore` for directory walking so `.gitignore` rules are honoured,
//! and an override glob to restrict which files are read.

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::policy::relative_display;
use crate::runtime::lock::LOCK_FILE_NAME;
use crate::runtime::workspace::Workspace;
use crate::tools::types::ToolError;

pub const MAX_SEARCH_LIMIT: usize = 500;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
const MAX_SNIPPET_CHARS: usize = 300;

const SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    ".venv",
    "venv",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".gradle",
    ".m2",
    ".npm-cache",
    ".next",
    ".idea",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "gz", "tgz", "bz2", "xz",
    "7z", "rar", "jar", "war", "class", "so", "dylib", "dll", "exe", "o", "a", "pyc", "wasm",
    "woff", "woff2", "ttf", "otf", "mp3", "mp4", "mov", "sqlite", "db",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    pub matches: Vec<SearchMatch>,
    pub truncated: bool,
}

pub fn search_text(
    workspace: &Workspace,
    query: &str,
    glob: &str,
    limit: usize,
) -> Result<SearchResults, ToolError> {
    if query.is_empty() {
        return Err(ToolError::InvalidArguments("query must not be empty".into()));
    }
    let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
    let root = &workspace.root_path;

    let mut overrides = OverrideBuilder::new(root);
    overrides
        .add(glob)
        .map_err(|e| ToolError::InvalidArguments(format!("invalid glob {glob:?}: {e}")))?;
    let overrides = overrides
        .build()
        .map_err(|e| ToolError::InvalidArguments(format!("invalid glob {glob:?}: {e}")))?;

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .follow_links(false)
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !(is_dir && SKIP_DIRS.contains(&&*name))
        })
        .build();

    let mut matches = Vec::new();
    let mut truncated = false;

    'files: for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if path.file_name().is_some_and(|n| n == LOCK_FILE_NAME) || is_binary(path) {
            continue;
        }
        if !overrides.matched(path, false).is_whitelist() {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };

        let rel = relative_display(root, path);
        for (index, line) in text.lines().enumerate() {
            if !line.contains(query) {
                continue;
            }
            if matches.len() >= limit {
                truncated = true;
                break 'files;
            }
            matches.push(SearchMatch {
                path: rel.clone(),
                line: index + 1,
                snippet: snippet(line),
            });
        }
    }

    tracing::debug!(slug = %workspace.slug, query, found = matches.len(), "text search finished");
    Ok(SearchResults {
        query: query.to_string(),
        matches,
        truncated,
    })
}

fn is_binary(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn snippet(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() <= MAX_SNIPPET_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(MAX_SNIPPET_CHARS).collect()
    }
}
