use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::CommandError;

/// Upper bound on draining pipes after the child has exited or been killed.
/// A grandchild that escaped the process group could otherwise hold them open.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A fully validated process invocation.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Canonical workspace root. Container executors mount exactly this.
    pub workspace_root: PathBuf,
    /// Absolute working directory, already contained in `workspace_root`.
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// What happened to the process. Identical shape for every executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
    pub command_not_found: bool,
}

impl ProcessOutcome {
    pub fn not_found(hint: impl Into<String>) -> Self {
        Self {
            stderr: hint.into(),
            command_not_found: true,
            ..Self::default()
        }
    }
}

/// Spawns an already-approved program somewhere: on the host or in a container.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, spec: &ExecSpec) -> Result<ProcessOutcome, CommandError>;
}

/// Spawn `command`, capture capped output, and kill its whole process group
/// if it outlives `timeout`.
///
/// Returns the spawn error untouched so callers can tell a missing program
/// apart from other failures.
pub(crate) async fn run_to_completion(
    mut command: Command,
    timeout: Duration,
    max_output_bytes: usize,
) -> std::io::Result<ProcessOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;

    // Each stream gets half the budget so one cannot starve the other.
    let per_stream = (max_output_bytes / 2).max(1);
    let stdout_task = spawn_reader(child.stdout.take(), per_stream);
    let stderr_task = spawn_reader(child.stderr.take(), per_stream);

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            kill_process_group(&child);
            let _ = child.kill().await;
            (None, true)
        }
    };

    let (stdout, stdout_truncated) = drain(stdout_task).await;
    let (mut stderr, stderr_truncated) = drain(stderr_task).await;
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("Command timed out after {}ms", timeout.as_millis()));
    }

    Ok(ProcessOutcome {
        stdout,
        stderr,
        exit_code,
        timed_out,
        truncated: stdout_truncated || stderr_truncated,
        command_not_found: false,
    })
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a negative pid signals the process group created
        // by `process_group(0)`, whose id equals the child's pid.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn spawn_reader<R>(reader: Option<R>, cap: usize) -> JoinHandle<CappedBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = CappedBuffer::new(cap);
        let Some(mut reader) = reader else {
            return buffer;
        };
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&chunk[..n]),
            }
        }
        buffer
    })
}

async fn drain(mut task: JoinHandle<CappedBuffer>) -> (String, bool) {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(buffer)) => buffer.finish(),
        Ok(Err(_)) => (String::new(), false),
        Err(_) => {
            task.abort();
            (String::new(), false)
        }
    }
}

/// Keeps the first and last `cap / 2` bytes of a stream and counts the rest.
#[derive(Debug)]
pub(crate) struct CappedBuffer {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    head_cap: usize,
    tail_cap: usize,
    dropped: usize,
}

impl CappedBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        let head_cap = cap / 2;
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            head_cap,
            tail_cap: cap - head_cap,
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, mut bytes: &[u8]) {
        if self.head.len() < self.head_cap {
            let take = (self.head_cap - self.head.len()).min(bytes.len());
            self.head.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        self.tail.extend(bytes);
        if self.tail.len() > self.tail_cap {
            let excess = self.tail.len() - self.tail_cap;
            self.tail.drain(..excess);
            self.dropped += excess;
        }
    }

    /// Lossy UTF-8 text and whether anything was cut.
    pub(crate) fn finish(self) -> (String, bool) {
        let head = String::from_utf8_lossy(&self.head).into_owned();
        let tail_bytes: Vec<u8> = self.tail.into_iter().collect();
        let tail = String::from_utf8_lossy(&tail_bytes);
        if self.dropped == 0 {
            return (head + tail.as_ref(), false);
        }
        (
            format!(
                "{head}\n... [{} bytes truncated] ...\n{tail}",
                self.dropped
            ),
            true,
        )
    }
}
