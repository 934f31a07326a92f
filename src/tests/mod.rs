//! Cross-module scenario tests and shared helpers.

use std::path::Path;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::model::ModelClient;
use crate::runtime::{AgentRuntime, EventEnvelope, Workspace};
use crate::tools::ToolCall;

#[cfg(test)]
mod events;

#[cfg(test)]
mod integration;

/// Config rooted in `base` with short limits suitable for tests.
pub fn test_config(base: &Path) -> RuntimeConfig {
    RuntimeConfig {
        workspace_dir: base.to_path_buf(),
        command_timeout_secs: 30,
        lock_wait_secs: 30,
        max_output_bytes: 64_000,
        ..RuntimeConfig::default()
    }
}

pub fn runtime(base: &Path, model: Arc<dyn ModelClient>) -> AgentRuntime {
    runtime_with(&test_config(base), model)
}

pub fn runtime_with(config: &RuntimeConfig, model: Arc<dyn ModelClient>) -> AgentRuntime {
    AgentRuntime::from_config(config, model).expect("default policy is valid")
}

/// Runtime without a usable model, for dispatcher-level tests.
pub fn tool_runtime(base: &Path) -> AgentRuntime {
    runtime(base, Arc::new(crate::testing::ScriptedModel::default()))
}

pub fn resolve(runtime: &AgentRuntime, slug: &str) -> Workspace {
    runtime.workspaces().resolve(slug).expect("workspace resolves")
}

pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Event `type` tags in order, for compact assertions.
pub fn event_types(events: &[EventEnvelope]) -> Vec<String> {
    events
        .iter()
        .map(|e| {
            serde_json::to_value(&e.event)
                .ok()
                .and_then(|v| v["type"].as_str().map(str::to_string))
                .unwrap_or_default()
        })
        .collect()
}
