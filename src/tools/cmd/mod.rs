//! Allow-listed process execution inside a workspace.
//!
//! [`CommandRunner`] validates a request (shell tokens, allow-list, working
//! directory) and hands the resulting [`ExecSpec`] to a [`ProcessExecutor`].
//! Host and container executors share one outcome shape, so callers never
//! branch on where a command ran.

mod container;
mod executor;
mod host;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use container::{ContainerConfig, ContainerExecutor};
pub use executor::{ExecSpec, ProcessExecutor, ProcessOutcome};
pub use host::{not_found_hint, HostExecutor};

pub(crate) use executor::run_to_completion;

use crate::policy::{
    blocked_shell_token, relative_display, split_command_line, CommandPolicy, ContainmentError,
    PolicyDecision,
};
use crate::runtime::workspace::Workspace;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not allowed: {0}")]
    NotAllowed(String),
    #[error("invalid command: {0}")]
    Invalid(String),
    #[error(transparent)]
    Path(#[from] ContainmentError),
    #[error("working directory does not exist or is not a directory: {0}")]
    MissingCwd(String),
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A request as issued by the model, before validation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Program name, or a whole command line when `args` is empty.
    pub command: String,
    pub args: Vec<String>,
    /// Working directory relative to the workspace root.
    pub cwd: Option<String>,
    pub timeout: Duration,
    pub use_container: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExecution {
    pub command: String,
    pub args: Vec<String>,
    /// Workspace-relative working directory.
    pub cwd: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub ran_in_container: bool,
    pub truncated: bool,
    pub command_not_found: bool,
}

pub struct CommandRunner {
    policy: CommandPolicy,
    host: Arc<dyn ProcessExecutor>,
    container: Arc<dyn ProcessExecutor>,
    max_output_bytes: usize,
}

impl CommandRunner {
    pub fn new(policy: CommandPolicy, container: ContainerConfig, max_output_bytes: usize) -> Self {
        Self::with_executors(
            policy,
            Arc::new(HostExecutor),
            Arc::new(ContainerExecutor::new(container)),
            max_output_bytes,
        )
    }

    pub fn with_executors(
        policy: CommandPolicy,
        host: Arc<dyn ProcessExecutor>,
        container: Arc<dyn ProcessExecutor>,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            policy,
            host,
            container,
            max_output_bytes,
        }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    fn executor(&self, use_container: bool) -> &Arc<dyn ProcessExecutor> {
        if use_container {
            &self.container
        } else {
            &self.host
        }
    }

    /// Validate and run one command. Nothing is spawned unless every check
    /// passes. A timeout or a missing program is reported inside the
    /// returned [`CommandExecution`], not as an error.
    pub async fn run(
        &self,
        workspace: &Workspace,
        request: CommandRequest,
    ) -> Result<CommandExecution, CommandError> {
        let line = request.command.trim();
        if line.is_empty() {
            return Err(CommandError::Invalid("command is empty".into()));
        }
        if let Some(token) = blocked_shell_token(line) {
            return Err(CommandError::NotAllowed(format!(
                "blocked shell token detected: {token}"
            )));
        }

        let (program, mut args) = if request.args.is_empty() && line.contains(char::is_whitespace)
        {
            let mut words = split_command_line(line).map_err(CommandError::Invalid)?;
            if words.is_empty() {
                return Err(CommandError::Invalid("command is empty".into()));
            }
            let program = words.remove(0);
            (program, words)
        } else {
            (line.to_string(), request.args)
        };

        // Models often repeat the program as the first argument.
        if args.first() == Some(&program) {
            args.remove(0);
        }

        if let PolicyDecision::Deny(reason) = self.policy.evaluate_command(&program) {
            tracing::info!(slug = %workspace.slug, program = %program, "command denied by policy");
            return Err(CommandError::NotAllowed(reason));
        }

        let cwd_rel = request.cwd.as_deref().unwrap_or(".");
        let cwd = workspace.contain(cwd_rel)?;
        if !cwd.is_dir() {
            return Err(CommandError::MissingCwd(cwd_rel.to_string()));
        }

        let spec = ExecSpec {
            program,
            args,
            workspace_root: workspace.root_path.clone(),
            cwd,
            timeout: request.timeout,
            max_output_bytes: self.max_output_bytes,
        };
        let executor = self.executor(request.use_container);

        let started = Instant::now();
        let outcome = executor.execute(&spec).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            slug = %workspace.slug,
            program = %spec.program,
            executor = executor.name(),
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            elapsed_ms = duration_ms,
            "command finished"
        );

        Ok(CommandExecution {
            cwd: relative_display(&workspace.root_path, &spec.cwd),
            command: spec.program,
            args: spec.args,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            duration_ms,
            ran_in_container: request.use_container,
            truncated: outcome.truncated,
            command_not_found: outcome.command_not_found,
        })
    }
}
