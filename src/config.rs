//! Runtime configuration.
//!
//! Values come from environment variables; the CLI loads a `.env` file with
//! `dotenvy` before calling [`RuntimeConfig::from_env`]. Every field has a
//! default, so an empty environment yields a working local setup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::CommandPolicy;
use crate::tools::cmd::ContainerConfig;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LOCK_WAIT_SECS: u64 = 30;
/// Added on top of the command timeout so a lock always outlives the
/// longest tool execution it protects.
pub const LOCK_TTL_MARGIN_SECS: u64 = 60;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 200_000;
pub const DEFAULT_MAX_ITERATIONS: usize = 120;
pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama-3.1-8b-instant";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub workspace_dir: PathBuf,
    pub command_timeout_secs: u64,
    /// Explicit lock TTL. When unset the TTL is derived from the command
    /// timeout plus [`LOCK_TTL_MARGIN_SECS`].
    pub lock_ttl_secs: Option<u64>,
    pub lock_wait_secs: u64,
    pub max_output_bytes: usize,
    pub use_container: bool,
    pub max_iterations: usize,
    pub allowed_commands: Vec<String>,
    pub allowed_command_patterns: Vec<String>,
    pub container: ContainerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            lock_ttl_secs: None,
            lock_wait_secs: DEFAULT_LOCK_WAIT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            use_container: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            allowed_commands: Vec::new(),
            allowed_command_patterns: Vec::new(),
            container: ContainerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = env_value(&["PDD_WORKSPACE_DIR", "AI_WORKSPACE_DIR"]) {
            config.workspace_dir = PathBuf::from(dir);
        }
        if let Some(raw) = env_value(&["PDD_COMMAND_TIMEOUT_SECS"]) {
            config.command_timeout_secs = parse_positive("PDD_COMMAND_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = env_value(&["PDD_LOCK_TTL_SECS"]) {
            config.lock_ttl_secs = Some(parse_positive("PDD_LOCK_TTL_SECS", &raw)?);
        }
        if let Some(raw) = env_value(&["PDD_LOCK_WAIT_SECS"]) {
            config.lock_wait_secs = parse_number("PDD_LOCK_WAIT_SECS", &raw)?;
        }
        if let Some(raw) = env_value(&["PDD_MAX_OUTPUT_BYTES"]) {
            config.max_output_bytes = parse_positive("PDD_MAX_OUTPUT_BYTES", &raw)? as usize;
        }
        if let Some(raw) = env_value(&["PDD_USE_DOCKER_FOR_RUNTIMES"]) {
            config.use_container = parse_bool("PDD_USE_DOCKER_FOR_RUNTIMES", &raw)?;
        }
        if let Some(raw) = env_value(&["PDD_MAX_ITERATIONS"]) {
            config.max_iterations = parse_positive("PDD_MAX_ITERATIONS", &raw)? as usize;
        }
        if let Some(raw) = env_value(&["PDD_ALLOWED_COMMANDS"]) {
            config.allowed_commands = split_list(&raw);
        }
        if let Some(raw) = env_value(&["PDD_ALLOWED_COMMAND_PATTERNS"]) {
            config.allowed_command_patterns = split_list(&raw);
        }
        if let Some(binary) = env_value(&["PDD_CONTAINER_BINARY"]) {
            config.container.binary = binary;
        }
        if let Some(image) = env_value(&["PDD_CONTAINER_IMAGE"]) {
            config.container.default_image = image;
        }

        // Surface bad patterns at startup rather than on the first command.
        config.command_policy()?;
        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    /// Lock TTL, never shorter than the command timeout plus margin.
    pub fn lock_ttl(&self) -> Duration {
        let floor = self.command_timeout_secs.max(1) + LOCK_TTL_MARGIN_SECS;
        Duration::from_secs(self.lock_ttl_secs.unwrap_or(floor).max(floor))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn command_policy(&self) -> Result<CommandPolicy, ConfigError> {
        CommandPolicy::with_defaults(&self.allowed_commands, &self.allowed_command_patterns)
            .map_err(|e| ConfigError::InvalidValue {
                key: "PDD_ALLOWED_COMMAND_PATTERNS",
                value: self.allowed_command_patterns.join(","),
                reason: e.to_string(),
            })
    }
}

/// Credentials and endpoint for the OpenAI-compatible chat provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key =
            env_value(&["PDD_API_KEY", "GROQ_API_KEY"]).ok_or(ConfigError::Missing("PDD_API_KEY"))?;
        Ok(Self {
            api_key,
            model: env_value(&["PDD_MODEL"]).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: env_value(&["PDD_BASE_URL"]).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

fn env_value(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

fn parse_number(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match parse_number(key, raw)? {
        0 => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".into(),
        }),
        value => Ok(value),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected true or false".into(),
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
