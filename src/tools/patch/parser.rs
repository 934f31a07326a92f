//! Parser for unified diffs.
//!
//! Accepts the output of `diff -u` and `git diff`:
//! ```text
//! Patch    := { Preamble } { FileDiff }
//! FileDiff := "--- " old LF "+++ " new LF { Hunk }
//! Hunk     := "@@ -" start [ "," len ] " +" start [ "," len ] " @@" [ text ] LF { Line }
//! Line     := (" " | "-" | "+") text LF | "\ No newline at end of file" LF
//! ```
//! `/dev/null` on the old side creates a file, on the new side deletes it.
//! Git's `a/` and `b/` prefixes are stripped. Hunk line counts are enforced
//! exactly, so a truncated or padded hunk is a parse error rather than a
//! silent partial apply.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const OLD_FILE_MARKER: &str = "--- ";
const NEW_FILE_MARKER: &str = "+++ ";
const HUNK_MARKER: &str = "@@";
const DEV_NULL: &str = "/dev/null";

/// Git extended header lines that carry nothing the applier needs.
const IGNORED_HEADERS: &[&str] = &[
    "diff --git ",
    "index ",
    "new file mode ",
    "deleted file mode ",
    "old mode ",
    "new mode ",
    "similarity index ",
    "dissimilarity index ",
];

#[derive(Debug, PartialEq, Error, Clone)]
pub enum ParseError {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("invalid hunk at line {line_number}: {message}")]
    InvalidHunk { message: String, line_number: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Create,
    Delete,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
    /// The last old-side line had no trailing newline.
    pub old_missing_newline: bool,
    /// The last new-side line has no trailing newline.
    pub new_missing_newline: bool,
    /// 1-based line of the `@@` header in the patch text.
    pub line_number: usize,
}

impl Hunk {
    /// Lines the target file must contain for this hunk to apply.
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Remove(text) => Some(text.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Add(text) => Some(text.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    /// Index of the first old line, 0-based. A pure insertion (`-N,0`)
    /// goes after line N, which is index N.
    pub fn anchor(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Workspace-relative path with any `a/`/`b/` prefix removed.
    pub path: String,
    pub kind: PatchKind,
    pub hunks: Vec<Hunk>,
}

/// Parse unified diff text into per-file patches.
///
/// `default_path` names the target of hunks that appear without a
/// `---`/`+++` header pair.
pub fn parse_unified_diff(
    text: &str,
    default_path: Option<&str>,
) -> Result<Vec<FilePatch>, ParseError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut files: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut index = 0;

    while index < lines.len() {
        let line = lines[index];
        let line_number = index + 1;

        if IGNORED_HEADERS.iter().any(|h| line.starts_with(h)) {
            index += 1;
            continue;
        }
        if line.starts_with("rename from ") || line.starts_with("copy from ") {
            return Err(ParseError::InvalidHunk {
                message: "renames and copies are not supported; delete and create instead".into(),
                line_number,
            });
        }
        if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            return Err(ParseError::InvalidHunk {
                message: "binary patches are not supported".into(),
                line_number,
            });
        }

        if let Some(old_raw) = line.strip_prefix(OLD_FILE_MARKER) {
            let new_raw = lines
                .get(index + 1)
                .and_then(|next| next.strip_prefix(NEW_FILE_MARKER))
                .ok_or_else(|| ParseError::InvalidHunk {
                    message: "'---' header must be followed by a '+++' header".into(),
                    line_number,
                })?;
            let file = file_from_headers(old_raw, new_raw, line_number)?;
            push_file(&mut files, current.take())?;
            current = Some(file);
            index += 2;
            continue;
        }

        if line.starts_with(HUNK_MARKER) {
            if current.is_none() {
                let path = default_path
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| ParseError::InvalidHunk {
                        message: "hunk appears before any '---'/'+++' file header".into(),
                        line_number,
                    })?;
                current = Some(FilePatch {
                    path: path.to_string(),
                    kind: PatchKind::Modify,
                    hunks: Vec::new(),
                });
            }
            let (hunk, consumed) = parse_hunk(&lines[index..], line_number)?;
            if let Some(file) = current.as_mut() {
                file.hunks.push(hunk);
            }
            index += consumed;
            continue;
        }

        // Commit messages, `diff` command lines and other prose between files.
        index += 1;
    }
    push_file(&mut files, current.take())?;

    if files.is_empty() {
        return Err(ParseError::InvalidPatch(
            "patch contains no file changes".into(),
        ));
    }
    Ok(files)
}

fn push_file(files: &mut Vec<FilePatch>, file: Option<FilePatch>) -> Result<(), ParseError> {
    let Some(file) = file else {
        return Ok(());
    };
    if file.kind == PatchKind::Modify && file.hunks.is_empty() {
        return Err(ParseError::InvalidPatch(format!(
            "no hunks for '{}'",
            file.path
        )));
    }
    if files.iter().any(|existing| existing.path == file.path) {
        return Err(ParseError::InvalidPatch(format!(
            "'{}' appears more than once; combine its hunks into one file section",
            file.path
        )));
    }
    files.push(file);
    Ok(())
}

fn file_from_headers(
    old_raw: &str,
    new_raw: &str,
    line_number: usize,
) -> Result<FilePatch, ParseError> {
    let old = header_path(old_raw, "a/");
    let new = header_path(new_raw, "b/");
    let (path, kind) = match (old, new) {
        (None, Some(new)) => (new, PatchKind::Create),
        (Some(old), None) => (old, PatchKind::Delete),
        // `diff -u file.orig file` style: the new side names the target.
        (Some(_), Some(new)) => (new, PatchKind::Modify),
        (None, None) => {
            return Err(ParseError::InvalidHunk {
                message: "both sides of the file header are /dev/null".into(),
                line_number,
            })
        }
    };
    if path.is_empty() {
        return Err(ParseError::InvalidHunk {
            message: "file header has an empty path".into(),
            line_number,
        });
    }
    Ok(FilePatch {
        path,
        kind,
        hunks: Vec::new(),
    })
}

/// Path from a `---`/`+++` header, or `None` for `/dev/null`.
fn header_path(raw: &str, git_prefix: &str) -> Option<String> {
    // Drop the optional tab-separated timestamp written by `diff -u`.
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    let raw = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(raw);
    if raw == DEV_NULL {
        return None;
    }
    Some(raw.strip_prefix(git_prefix).unwrap_or(raw).to_string())
}

fn parse_hunk(lines: &[&str], line_number: usize) -> Result<(Hunk, usize), ParseError> {
    let (old_start, old_len, new_start, new_len) =
        parse_hunk_header(lines[0]).ok_or_else(|| ParseError::InvalidHunk {
            message: format!(
                "malformed hunk header '{}'; expected '@@ -start,len +start,len @@'",
                lines[0]
            ),
            line_number,
        })?;

    let mut hunk = Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines: Vec::new(),
        old_missing_newline: false,
        new_missing_newline: false,
        line_number,
    };
    let mut old_remaining = old_len;
    let mut new_remaining = new_len;
    let mut consumed = 1;

    while old_remaining > 0 || new_remaining > 0 {
        let Some(raw) = lines.get(consumed) else {
            return Err(ParseError::InvalidHunk {
                message: format!(
                    "hunk ends early: expected {old_remaining} more old and {new_remaining} more new lines"
                ),
                line_number,
            });
        };
        let at = line_number + consumed;

        if raw.starts_with('\\') {
            mark_missing_newline(&mut hunk);
            consumed += 1;
            continue;
        }

        let (marker, text) = match raw.chars().next() {
            // Some editors strip the single space from blank context lines.
            None => (' ', ""),
            Some(c) => (c, &raw[c.len_utf8()..]),
        };
        let entry = match marker {
            ' ' if old_remaining > 0 && new_remaining > 0 => {
                old_remaining -= 1;
                new_remaining -= 1;
                HunkLine::Context(text.to_string())
            }
            '-' if old_remaining > 0 => {
                old_remaining -= 1;
                HunkLine::Remove(text.to_string())
            }
            '+' if new_remaining > 0 => {
                new_remaining -= 1;
                HunkLine::Add(text.to_string())
            }
            ' ' | '-' | '+' => {
                return Err(ParseError::InvalidHunk {
                    message: format!(
                        "hunk has more lines than its header declares (-{old_start},{old_len} +{new_start},{new_len})"
                    ),
                    line_number: at,
                })
            }
            _ => {
                return Err(ParseError::InvalidHunk {
                    message: format!(
                        "unexpected line inside hunk: '{raw}'; lines must start with ' ', '-' or '+'"
                    ),
                    line_number: at,
                })
            }
        };
        hunk.lines.push(entry);
        consumed += 1;
    }

    // The marker may follow the final line of the hunk.
    if lines.get(consumed).is_some_and(|l| l.starts_with('\\')) {
        mark_missing_newline(&mut hunk);
        consumed += 1;
    }

    Ok((hunk, consumed))
}

fn mark_missing_newline(hunk: &mut Hunk) {
    match hunk.lines.last() {
        Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
        Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
        Some(HunkLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        None => {}
    }
}

/// `@@ -12,5 +12,7 @@ fn main()` -> (12, 5, 12, 7). Omitted lengths are 1.
fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = line.strip_prefix("@@ ")?;
    let end = rest.find(" @@")?;
    let mut ranges = rest[..end].split_whitespace();
    let old = parse_range(ranges.next()?.strip_prefix('-')?)?;
    let new = parse_range(ranges.next()?.strip_prefix('+')?)?;
    if ranges.next().is_some() {
        return None;
    }
    Some((old.0, old.1, new.0, new.1))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
