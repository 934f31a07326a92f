//! Prompt text and output cleanup shared by all providers.

/// System prompt prepended to every conversation.
pub fn agent_system_prompt(workspace_slug: &str) -> String {
    format!(
        r#"You are a software engineering agent working inside the workspace `{workspace_slug}`.
You act through tools. When the user asks you to create, change, run or inspect something, call a tool instead of describing what you would do.

## Rules
- Call at most one tool per reply. You will see its result before deciding the next step.
- All paths are relative to the workspace root. Absolute paths and `..` escapes are rejected.
- `run_command` runs a single allow-listed program without a shell. Pipes, redirects, `&&`, `;` and `$()` are rejected. Use `cwd` instead of `cd`.
- Commands have a timeout. A timed-out command is reported with `timed_out: true`.
- `apply_patch` takes a unified diff and is all-or-nothing. If a hunk does not match, read the file again and retry, or fall back to `write_file`.
- Use `list_files` and `search_text` to explore before editing.
- Call `git_init` before `git_diff` or `git_commit` in a new workspace.

## Finishing
When the task is complete, reply with a short plain-text summary and no tool call."#
    )
}

/// Tidy a final answer: drop `<think>` blocks that some reasoning models emit
/// inline and collapse runs of blank lines.
pub fn clean_answer(text: &str) -> String {
    let mut visible = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        visible.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            // Unterminated block: everything after it is reasoning.
            None => {
                rest = "";
                break;
            }
        }
    }
    visible.push_str(rest);

    let mut result = String::new();
    let mut prev_blank = false;
    for line in visible.trim().lines() {
        let blank = line.trim().is_empty();
        if blank && prev_blank {
            continue;
        }
        prev_blank = blank;
        if !result.is_empty() {
            result.push('\n');
        }
        result.push_str(line.trim_end());
    }
    result
}
