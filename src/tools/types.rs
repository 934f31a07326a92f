//! Call/result envelope shared by the dispatcher, the agent loop and the
//! model client.

use serde::{Deserialize, Serialize};

use crate::policy::ContainmentError;
use crate::runtime::lock::LockError;
use crate::runtime::workspace::WorkspaceError;
use crate::tools::cmd::CommandError;
use crate::tools::git::GitError;
use crate::tools::patch::PatchError;

/// A tool request produced by the model.
///
/// `name` stays a string on the wire so an unknown name can be reported back
/// to the model instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Machine-readable failure category carried in [`ToolResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    PathEscape,
    LockTimeout,
    ToolNotFound,
    InvalidArguments,
    CommandNotAllowed,
    CommandNotFound,
    SubprocessTimeout,
    PatchConflict,
    GitNotInitialized,
    NothingToCommit,
    GitFailed,
    FileNotFound,
    FileTooLarge,
    Io,
    /// The workspace root itself is gone or unreadable. The agent loop
    /// treats this as fatal for the turn.
    WorkspaceUnavailable,
    /// The call was withdrawn while waiting for the workspace lock.
    Cancelled,
    Internal,
}

impl ToolErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, ToolErrorKind::WorkspaceUnavailable)
    }
}

/// Exactly one per [`ToolCall`], with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub ok: bool,
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: serde_json::Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            ok: true,
            output,
            error_kind: None,
        }
    }

    pub fn failure(call: &ToolCall, error: &ToolError) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            ok: false,
            output: serde_json::json!({ "error": error.to_string() }),
            error_kind: Some(error.kind()),
        }
    }

    /// Text handed back to the model as the tool message content.
    pub fn to_model_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.output.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Path(#[from] ContainmentError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file too large: {path} ({size} bytes, limit {limit})")]
    FileTooLarge { path: String, size: u64, limit: u64 },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("tool panicked: {0}")]
    Panic(String),
    #[error("cancelled before the workspace lock was acquired")]
    Cancelled,
}

impl ToolError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ToolError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::NotFound(_) => ToolErrorKind::ToolNotFound,
            ToolError::InvalidArguments(_) => ToolErrorKind::InvalidArguments,
            ToolError::Path(e) if e.is_escape() => ToolErrorKind::PathEscape,
            ToolError::Path(_) => ToolErrorKind::WorkspaceUnavailable,
            ToolError::Lock(_) => ToolErrorKind::LockTimeout,
            ToolError::CommandNotAllowed(_) => ToolErrorKind::CommandNotAllowed,
            ToolError::Patch(PatchError::Parse(_)) => ToolErrorKind::InvalidArguments,
            ToolError::Patch(PatchError::Conflict { .. }) => ToolErrorKind::PatchConflict,
            ToolError::Patch(PatchError::Path(e)) if e.is_escape() => ToolErrorKind::PathEscape,
            ToolError::Patch(PatchError::Path(_)) => ToolErrorKind::WorkspaceUnavailable,
            ToolError::Patch(PatchError::Reserved(_)) => ToolErrorKind::InvalidArguments,
            ToolError::Patch(_) => ToolErrorKind::Io,
            ToolError::Git(GitError::NotInitialized) => ToolErrorKind::GitNotInitialized,
            ToolError::Git(GitError::NothingToCommit) => ToolErrorKind::NothingToCommit,
            ToolError::Git(GitError::EmptyMessage) => ToolErrorKind::InvalidArguments,
            ToolError::Git(_) => ToolErrorKind::GitFailed,
            ToolError::Workspace(WorkspaceError::InvalidSlug(_)) => ToolErrorKind::InvalidArguments,
            ToolError::Workspace(_) => ToolErrorKind::WorkspaceUnavailable,
            ToolError::FileNotFound(_) => ToolErrorKind::FileNotFound,
            ToolError::FileTooLarge { .. } => ToolErrorKind::FileTooLarge,
            ToolError::Io { .. } => ToolErrorKind::Io,
            ToolError::Execution(_) => ToolErrorKind::Internal,
            ToolError::Panic(_) => ToolErrorKind::Internal,
            ToolError::Cancelled => ToolErrorKind::Cancelled,
        }
    }
}

impl From<CommandError> for ToolError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::NotAllowed(reason) => ToolError::CommandNotAllowed(reason),
            CommandError::Invalid(reason) => ToolError::InvalidArguments(reason),
            CommandError::Path(e) => ToolError::Path(e),
            CommandError::MissingCwd(cwd) => ToolError::FileNotFound(cwd),
            CommandError::Spawn { program, source } => ToolError::io(program, source),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn call() -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: "read_file".into(),
            arguments: serde_json::json!({ "path": "a.txt" }),
        }
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            ToolError::from(ContainmentError::Traversal("..".into())).kind(),
            ToolErrorKind::PathEscape
        );
        assert_eq!(
            ToolError::from(CommandError::NotAllowed("rm".into())).kind(),
            ToolErrorKind::CommandNotAllowed
        );
        assert_eq!(
            ToolError::from(GitError::NothingToCommit).kind(),
            ToolErrorKind::NothingToCommit
        );
        assert_eq!(
            ToolError::from(PatchError::Conflict {
                path: "a".into(),
                message: "x".into()
            })
            .kind(),
            ToolErrorKind::PatchConflict
        );
        assert_eq!(
            ToolError::from(WorkspaceError::InvalidSlug("!!".into())).kind(),
            ToolErrorKind::InvalidArguments
        );

        let gone = ContainmentError::RootUnavailable {
            root: "/tmp/ws".into(),
            reason: "No such file or directory".into(),
        };
        assert_eq!(ToolError::from(gone.clone()).kind(), ToolErrorKind::WorkspaceUnavailable);
        assert_eq!(
            ToolError::from(PatchError::Path(gone)).kind(),
            ToolErrorKind::WorkspaceUnavailable
        );
        assert!(ToolErrorKind::WorkspaceUnavailable.is_fatal());
        assert!(!ToolErrorKind::Io.is_fatal());
    }

    #[test]
    fn failure_result_serializes_kind() {
        let result = ToolResult::failure(&call(), &ToolError::FileNotFound("a.txt".into()));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["id"], "call_1");
        assert_eq!(value["ok"], false);
        assert_eq!(value["error_kind"], "file_not_found");
        assert_eq!(value["output"]["error"], "file not found: a.txt");
    }

    #[test]
    fn success_result_omits_kind() {
        let result = ToolResult::success(&call(), serde_json::json!({ "content": "hi" }));
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("error_kind").is_none());
        assert_eq!(value["output"]["content"], "hi");
    }

    #[test]
    fn call_without_arguments_deserializes() {
        let parsed: ToolCall =
            serde_json::from_str(r#"{"id":"1","name":"git_status"}"#).unwrap();
        assert_eq!(parsed.arguments, serde_json::Value::Null);
    }
}
