//! Workspace-isolated tool execution runtime for coding agents.
//!
//! An agent turns a conversation into a sequence of tool calls (file access,
//! unified-diff patches, allow-listed commands, git) that run inside one
//! workspace directory, one at a time per workspace.
//!
//! # Architecture
//!
//! - `config`: runtime and provider settings loaded from the environment
//! - `runtime`: workspaces, the per-workspace lock, the agent loop and its event stream
//! - `tools`: tool handlers and the `ToolDispatcher`
//! - `model`: the `ModelClient` trait and the OpenAI-compatible client
//! - `policy`: path containment and the command allow-list
//! - `core`: shared tool descriptor types
//! - `testing`: a scripted model client for tests and demos

pub mod config;
pub mod core;
pub mod model;
pub mod policy;
pub mod runtime;
pub mod testing;
pub mod tools;

#[cfg(test)]
mod tests;

pub use config::{ProviderConfig, RuntimeConfig};
pub use runtime::{AgentEvent, AgentRuntime, AgentStream, AgentTurn, EventEnvelope, TurnStatus};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

/// Top-level error for binaries embedding the runtime.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Workspace(#[from] runtime::WorkspaceError),
    #[error(transparent)]
    Model(#[from] model::ModelError),
    #[error(transparent)]
    Agent(#[from] runtime::AgentError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
