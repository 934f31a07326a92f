//! Tool registry and dispatch.
//!
//! Tools are keyed by [`ToolName`]; each name parses its JSON arguments into
//! a typed [`ToolInvocation`] before anything runs. Dispatch then:
//!
//! 1. resolves the name (unknown → `tool_not_found`)
//! 2. validates arguments (missing, extra or mistyped → `invalid_arguments`)
//! 3. checks the workspace root is still there and acquires the lock
//! 4. runs the handler, containing panics
//! 5. releases the lock on every exit path and returns one [`ToolResult`]

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::core::tool::ToolDescriptor;
use crate::runtime::lock::WorkspaceLock;
use crate::runtime::workspace::Workspace;
use crate::tools::cmd::{CommandRequest, CommandRunner};
use crate::tools::git::GitAdapter;
use crate::tools::types::{ToolCall, ToolError, ToolErrorKind, ToolResult};
use crate::tools::{fs, patch, search};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    ReadFile,
    WriteFile,
    ListFiles,
    FileExists,
    MakeDir,
    SearchText,
    ApplyPatch,
    RunCommand,
    GitInit,
    GitStatus,
    GitDiff,
    GitCommit,
}

impl ToolName {
    pub const ALL: [ToolName; 12] = [
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::ListFiles,
        ToolName::FileExists,
        ToolName::MakeDir,
        ToolName::SearchText,
        ToolName::ApplyPatch,
        ToolName::RunCommand,
        ToolName::GitInit,
        ToolName::GitStatus,
        ToolName::GitDiff,
        ToolName::GitCommit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::ListFiles => "list_files",
            ToolName::FileExists => "file_exists",
            ToolName::MakeDir => "make_dir",
            ToolName::SearchText => "search_text",
            ToolName::ApplyPatch => "apply_patch",
            ToolName::RunCommand => "run_command",
            ToolName::GitInit => "git_init",
            ToolName::GitStatus => "git_status",
            ToolName::GitDiff => "git_diff",
            ToolName::GitCommit => "git_commit",
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        let name = self.as_str();
        match self {
            ToolName::ReadFile => ToolDescriptor::for_args::<ReadFileArgs>(
                name,
                "Read a UTF-8 text file from the workspace (up to 500 KB).",
            ),
            ToolName::WriteFile => ToolDescriptor::for_args::<WriteFileArgs>(
                name,
                "Create or overwrite a file with the given content. Parent directories are created.",
            ),
            ToolName::ListFiles => ToolDescriptor::for_args::<ListFilesArgs>(
                name,
                "List files and directories under a path, depth-bounded.",
            ),
            ToolName::FileExists => ToolDescriptor::for_args::<PathArgs>(
                name,
                "Check whether a path exists and whether it is a file or directory.",
            ),
            ToolName::MakeDir => ToolDescriptor::for_args::<PathArgs>(
                name,
                "Create a directory and any missing parents.",
            ),
            ToolName::SearchText => ToolDescriptor::for_args::<SearchTextArgs>(
                name,
                "Search workspace files for a plain substring. Returns path, line and snippet per match.",
            ),
            ToolName::ApplyPatch => ToolDescriptor::for_args::<ApplyPatchArgs>(
                name,
                "Apply a unified diff. Either every hunk applies or no file is changed.",
            ),
            ToolName::RunCommand => ToolDescriptor::for_args::<RunCommandArgs>(
                name,
                "Run an allow-listed program (no shell). Returns stdout, stderr, exit code and whether it timed out.",
            ),
            ToolName::GitInit => {
                ToolDescriptor::for_args::<NoArgs>(name, "Initialize a git repository in the workspace.")
            }
            ToolName::GitStatus => ToolDescriptor::for_args::<NoArgs>(
                name,
                "Show git status. Reports repository=false for a plain directory.",
            ),
            ToolName::GitDiff => ToolDescriptor::for_args::<GitDiffArgs>(
                name,
                "Show unstaged changes, or staged changes with staged=true.",
            ),
            ToolName::GitCommit => ToolDescriptor::for_args::<GitCommitArgs>(
                name,
                "Stage all changes and commit them with the given message.",
            ),
        }
    }

    /// Parse `arguments` into this tool's argument shape.
    pub fn parse_args(self, arguments: &serde_json::Value) -> Result<ToolInvocation, ToolError> {
        Ok(match self {
            ToolName::ReadFile => ToolInvocation::ReadFile(parse(arguments)?),
            ToolName::WriteFile => ToolInvocation::WriteFile(parse(arguments)?),
            ToolName::ListFiles => ToolInvocation::ListFiles(parse(arguments)?),
            ToolName::FileExists => ToolInvocation::FileExists(parse(arguments)?),
            ToolName::MakeDir => ToolInvocation::MakeDir(parse(arguments)?),
            ToolName::SearchText => ToolInvocation::SearchText(parse(arguments)?),
            ToolName::ApplyPatch => ToolInvocation::ApplyPatch(parse(arguments)?),
            ToolName::RunCommand => ToolInvocation::RunCommand(parse(arguments)?),
            ToolName::GitInit => {
                parse::<NoArgs>(arguments)?;
                ToolInvocation::GitInit
            }
            ToolName::GitStatus => {
                parse::<NoArgs>(arguments)?;
                ToolInvocation::GitStatus
            }
            ToolName::GitDiff => ToolInvocation::GitDiff(parse(arguments)?),
            ToolName::GitCommit => ToolInvocation::GitCommit(parse(arguments)?),
        })
    }
}

impl FromStr for ToolName {
    type Err = ToolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|name| name.as_str() == raw)
            .ok_or_else(|| ToolError::NotFound(raw.to_string()))
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse<T: DeserializeOwned>(arguments: &serde_json::Value) -> Result<T, ToolError> {
    // Models send `null` or nothing for tools without parameters.
    let value = if arguments.is_null() {
        serde_json::json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn default_dot() -> String {
    ".".into()
}

fn default_depth() -> usize {
    4
}

fn default_list_limit() -> usize {
    200
}

fn default_glob() -> String {
    "**/*".into()
}

fn default_search_limit() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PathArgs {
    /// Path relative to the workspace root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    /// Path relative to the workspace root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    /// Path relative to the workspace root.
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListFilesArgs {
    /// Directory relative to the workspace root. Defaults to the root.
    #[serde(default = "default_dot")]
    pub path: String,
    /// How many directory levels below `path` to descend.
    #[serde(default = "default_depth")]
    pub max_depth: usize,
    /// Maximum number of entries (at most 1000).
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchTextArgs {
    /// Plain substring to look for (case-sensitive).
    pub query: String,
    /// Glob restricting which files are searched.
    #[serde(default = "default_glob")]
    pub glob: String,
    /// Maximum number of matches (at most 500).
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ApplyPatchArgs {
    /// Unified diff text.
    #[serde(alias = "patch")]
    pub diff: String,
    /// Target file for hunks that carry no `---`/`+++` header.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RunCommandArgs {
    /// Program name, e.g. `python3`. A full command line is split when `args` is empty.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the workspace root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Timeout in milliseconds, capped by the runtime's command timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Run inside a throwaway container. Defaults to the runtime setting.
    #[serde(default)]
    pub use_container: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GitDiffArgs {
    #[serde(default)]
    pub staged: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GitCommitArgs {
    pub message: String,
}

/// A tool call whose arguments passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    ListFiles(ListFilesArgs),
    FileExists(PathArgs),
    MakeDir(PathArgs),
    SearchText(SearchTextArgs),
    ApplyPatch(ApplyPatchArgs),
    RunCommand(RunCommandArgs),
    GitInit,
    GitStatus,
    GitDiff(GitDiffArgs),
    GitCommit(GitCommitArgs),
}

/// Limits applied to every dispatch.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub command_timeout: Duration,
    pub use_container: bool,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            use_container: config.use_container,
            lock_ttl: config.lock_ttl(),
            lock_wait: config.lock_wait(),
        }
    }
}

/// Routes validated tool calls to their handlers under the workspace lock.
pub struct ToolDispatcher {
    runner: CommandRunner,
    git: GitAdapter,
    lock: Arc<WorkspaceLock>,
    settings: DispatchSettings,
}

impl ToolDispatcher {
    pub fn new(
        runner: CommandRunner,
        git: GitAdapter,
        lock: Arc<WorkspaceLock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            runner,
            git,
            lock,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn lock(&self) -> &Arc<WorkspaceLock> {
        &self.lock
    }

    /// Descriptors for every tool, in a stable order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        ToolName::ALL.into_iter().map(ToolName::descriptor).collect()
    }

    pub async fn dispatch(&self, workspace: &Workspace, holder_id: &str, call: &ToolCall) -> ToolResult {
        self.dispatch_with_cancel(workspace, holder_id, call, None).await
    }

    /// Like [`dispatch`](Self::dispatch), but gives up with a `cancelled`
    /// result if `cancel` fires while the call is still waiting for the lock.
    /// Once the handler has started it always runs to completion.
    pub async fn dispatch_with_cancel(
        &self,
        workspace: &Workspace,
        holder_id: &str,
        call: &ToolCall,
        cancel: Option<&CancellationToken>,
    ) -> ToolResult {
        let started = Instant::now();
        let result = self.dispatch_inner(workspace, holder_id, call, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                tracing::info!(
                    slug = %workspace.slug,
                    tool = %call.name,
                    holder = holder_id,
                    ok = result.ok,
                    elapsed_ms,
                    "tool dispatched"
                );
                result
            }
            Err(error) => {
                tracing::info!(
                    slug = %workspace.slug,
                    tool = %call.name,
                    holder = holder_id,
                    kind = ?error.kind(),
                    elapsed_ms,
                    "tool failed: {error}"
                );
                ToolResult::failure(call, &error)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        workspace: &Workspace,
        holder_id: &str,
        call: &ToolCall,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolResult, ToolError> {
        let name = ToolName::from_str(&call.name)?;
        let invocation = name.parse_args(&call.arguments)?;
        workspace.contain(".")?;

        let acquire = self.lock.acquire_guard(
            &workspace.slug,
            holder_id,
            self.settings.lock_ttl,
            self.settings.lock_wait,
        );
        let guard = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ToolError::Cancelled),
                guard = acquire => guard?,
            },
            None => acquire.await?,
        };

        let outcome = AssertUnwindSafe(self.execute(workspace, invocation))
            .catch_unwind()
            .await;
        drop(guard);

        match outcome {
            Ok(Ok(result)) => Ok(result.into_result(call)),
            Ok(Err(error)) => Err(error),
            Err(panic) => Err(ToolError::Panic(panic_message(panic.as_ref()))),
        }
    }

    async fn execute(
        &self,
        workspace: &Workspace,
        invocation: ToolInvocation,
    ) -> Result<HandlerOutput, ToolError> {
        match invocation {
            ToolInvocation::ReadFile(args) => to_output(fs::read_file(workspace, &args.path)?),
            ToolInvocation::WriteFile(args) => {
                to_output(fs::write_file(workspace, &args.path, &args.content)?)
            }
            ToolInvocation::ListFiles(args) => to_output(fs::list_files(
                workspace,
                &args.path,
                args.max_depth,
                args.limit,
            )?),
            ToolInvocation::FileExists(args) => to_output(fs::file_exists(workspace, &args.path)?),
            ToolInvocation::MakeDir(args) => to_output(fs::make_dir(workspace, &args.path)?),
            ToolInvocation::SearchText(args) => to_output(search::search_text(
                workspace,
                &args.query,
                &args.glob,
                args.limit,
            )?),
            ToolInvocation::ApplyPatch(args) => to_output(patch::apply_patch(
                &workspace.root_path,
                &args.diff,
                args.path.as_deref(),
            )?),
            ToolInvocation::RunCommand(args) => self.run_command(workspace, args).await,
            ToolInvocation::GitInit => to_output(self.git.init(&workspace.root_path).await?),
            ToolInvocation::GitStatus => to_output(self.git.status(&workspace.root_path).await?),
            ToolInvocation::GitDiff(args) => {
                to_output(self.git.diff(&workspace.root_path, args.staged).await?)
            }
            ToolInvocation::GitCommit(args) => {
                to_output(self.git.commit(&workspace.root_path, &args.message).await?)
            }
        }
    }

    async fn run_command(
        &self,
        workspace: &Workspace,
        args: RunCommandArgs,
    ) -> Result<HandlerOutput, ToolError> {
        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.command_timeout)
            .min(self.settings.command_timeout);
        let request = CommandRequest {
            command: args.command,
            args: args.args,
            cwd: args.cwd,
            timeout,
            use_container: args.use_container.unwrap_or(self.settings.use_container),
        };
        let execution = self.runner.run(workspace, request).await?;

        // Timeouts and missing programs are data, but still flagged.
        let error_kind = if execution.timed_out {
            Some(ToolErrorKind::SubprocessTimeout)
        } else if execution.command_not_found {
            Some(ToolErrorKind::CommandNotFound)
        } else {
            None
        };
        let ok = error_kind.is_none() && execution.exit_code == Some(0);
        Ok(HandlerOutput {
            ok,
            output: serde_json::to_value(&execution)
                .map_err(|e| ToolError::Execution(e.to_string()))?,
            error_kind,
        })
    }
}

/// What a handler produced, before it is tied to a call id.
struct HandlerOutput {
    ok: bool,
    output: serde_json::Value,
    error_kind: Option<ToolErrorKind>,
}

impl HandlerOutput {
    fn into_result(self, call: &ToolCall) -> ToolResult {
        ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            ok: self.ok,
            output: self.output,
            error_kind: self.error_kind,
        }
    }
}

fn to_output<T: Serialize>(value: T) -> Result<HandlerOutput, ToolError> {
    Ok(HandlerOutput {
        ok: true,
        output: serde_json::to_value(value).map_err(|e| ToolError::Execution(e.to_string()))?,
        error_kind: None,
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
