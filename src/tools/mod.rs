//! Tool registry and implementations for agent operations.
//!
//! # Module Structure
//!
//! - `types`: call/result envelope (`ToolCall`, `ToolResult`, `ToolError`)
//! - `registry`: `ToolDispatcher`, the enum-keyed tool table
//! - `fs`: read, write, list, exists, mkdir
//! - `search`: plain-substring text search
//! - `patch`: atomic unified-diff application
//! - `cmd`: allow-listed process execution on the host or in a container
//! - `git`: init/status/diff/commit
//!
//! # Adding New Tools
//!
//! 1. Implement the handler in the appropriate submodule
//! 2. Add a `ToolName` variant with its argument struct and descriptor
//! 3. Route the new `ToolInvocation` variant in `ToolDispatcher::execute`

pub mod cmd;
pub mod fs;
pub mod git;
pub mod patch;
pub mod registry;
pub mod search;
pub mod types;

pub use registry::{DispatchSettings, ToolDispatcher, ToolInvocation, ToolName};
pub use types::{ToolCall, ToolError, ToolErrorKind, ToolResult};
