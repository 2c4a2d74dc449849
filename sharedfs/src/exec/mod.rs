//! Process execution engine.
//!
//! Every OS side effect of the agent goes through a [`CommandRunner`]. A runner
//! spawns one external program from an argument vector, captures its stdout and
//! stderr into a single buffer as the output is produced, and enforces a deadline.
//! The deadline covers both the process and the draining of its output: when it
//! elapses first, the child's whole process group is killed with `SIGKILL` and the
//! child is reaped before the runner returns. Every command is started as the leader
//! of a new process group so that background processes it spawned die with it.
//!
//! Two scheduling modes are provided and produce identical [`CommandResult`]s:
//!
//! - [`blocking`]: the calling thread is parked for the lifetime of the process.
//!   Usable from plain threads; [`BlockingExecutor`] wraps it for use inside tokio,
//!   handing the worker over with `block_in_place` on the multi-threaded runtime.
//! - [`reactor`]: the calling task is suspended while the process runs and the
//!   scheduler keeps driving other tasks. Exit and deadline are raced in a single
//!   `select!`, so exactly one of them resumes the task.
//!
//! [`retry`] layers a bounded fixed-delay retry on top of either mode.

pub mod blocking;
pub mod reactor;
pub mod retry;
pub mod shell;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub use blocking::BlockingExecutor;
pub use reactor::ReactorExecutor;
pub use retry::RetryPolicy;

/// Appended to the captured output of a command that was killed at its deadline.
pub const TIMEOUT_MARKER: &str = " TIMEOUT!";

/// Status reported when the program could not be started at all (mirrors the shell's 127).
pub const SPAWN_FAILURE_STATUS: i32 = 127;

/// Status reported for a command that was killed at its deadline.
pub const TIMED_OUT_STATUS: i32 = -1;

/// A program and its arguments, passed to the OS without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}

/// Renders the command the way it would be typed into a shell, for logs and error messages.
impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell::quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell::quote(arg))?;
        }
        Ok(())
    }
}

/// Outcome of one command execution. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit status; 0 is success. [`TIMED_OUT_STATUS`] when killed at the deadline,
    /// 128 + signal number when terminated by another signal.
    pub status: i32,
    /// Interleaved stdout and stderr.
    pub output: String,
    pub timed_out: bool,
    /// Pid of the child, when it was spawned.
    pub pid: Option<u32>,
}

impl CommandResult {
    pub(crate) fn exited(status: i32, output: String, pid: u32) -> Self {
        Self {
            status,
            output,
            timed_out: false,
            pid: Some(pid),
        }
    }

    pub(crate) fn timed_out(mut output: String, pid: u32) -> Self {
        output.push_str(TIMEOUT_MARKER);
        Self {
            status: TIMED_OUT_STATUS,
            output,
            timed_out: true,
            pid: Some(pid),
        }
    }

    pub(crate) fn spawn_failure(command: &CommandLine, err: &std::io::Error) -> Self {
        Self {
            status: SPAWN_FAILURE_STATUS,
            output: format!("{}: {}", command.program(), err),
            timed_out: false,
            pid: None,
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0 && !self.timed_out
    }

    /// Converts a non-successful result into the matching [`CommandError`], returning
    /// the captured output on success.
    pub fn into_checked(self, command: &CommandLine, timeout: Duration) -> Result<String, CommandError> {
        if self.timed_out {
            Err(CommandError::TimedOut {
                command: command.to_string(),
                timeout,
                output: self.output,
            })
        } else if self.status != 0 {
            Err(CommandError::Failed {
                command: command.to_string(),
                status: self.status,
                output: self.output,
            })
        } else {
            Ok(self.output)
        }
    }
}

/// Raised by the checked execution helpers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command \"{command}\" failed, STATUS: {status}, OUTPUT:\n{output}")]
    Failed { command: String, status: i32, output: String },

    #[error("Command \"{command}\" timed out after {timeout:?}, OUTPUT:\n{output}")]
    TimedOut {
        command: String,
        timeout: Duration,
        output: String,
    },
}

/// Which scheduling mode commands run under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// The calling task yields to the tokio scheduler while the process runs.
    #[default]
    Suspended,
    /// The calling thread blocks while the process runs.
    Blocking,
}

/// Executes external commands on behalf of the provisioner and reconciler.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`, killing it if it is still running after `timeout`.
    async fn run(&self, command: &CommandLine, timeout: Duration) -> CommandResult;

    /// Wait between retry attempts, in whatever way suits the runner's scheduling mode.
    async fn pause(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }

    /// Run `command` and turn a failure or timeout into an error.
    async fn run_checked(&self, command: &CommandLine, timeout: Duration) -> Result<String, CommandError> {
        self.run(command, timeout).await.into_checked(command, timeout)
    }
}

/// Build the runner for the configured scheduling mode.
pub fn executor_for(mode: ExecutionMode) -> Arc<dyn CommandRunner> {
    match mode {
        ExecutionMode::Suspended => Arc::new(ReactorExecutor),
        ExecutionMode::Blocking => Arc::new(BlockingExecutor),
    }
}

/// Shared sink for a child's stdout and stderr. Chunks are appended in the order the
/// reader threads or tasks receive them, which keeps the two streams interleaved.
#[derive(Clone, Default)]
pub(crate) struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub(crate) fn append(&self, chunk: &[u8]) {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(chunk);
    }

    pub(crate) fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// SIGKILL every process in the group led by `pid`.
///
/// Commands are spawned as process group leaders, so this also reaches anything they left
/// running in the background. Must only be called while the group still has a live member or
/// the leader is unreaped, otherwise the id may already belong to someone else.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // kill(0) would signal our own group.
    if pgid <= 0 {
        return;
    }
    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, error = %err, "killing process group failed");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) {}

/// Exit code of a finished child, mapping signal deaths to 128 + signal.
pub(crate) fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
