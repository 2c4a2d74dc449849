//! Suspended execution: the calling task yields while the process runs.
//!
//! The child's exit and the deadline are two futures raced inside one
//! `tokio::select!` owned by the waiting task. Whichever completes first resumes
//! the task; the other is dropped on the spot, so a late exit after a kill or a
//! timer after a normal exit has nothing left to wake. The same deadline bounds the
//! wait for the output pipes to close after the child exits.

use super::{CommandLine, CommandResult, CommandRunner, OutputBuffer, exit_code, kill_process_group};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Run `command` as a tokio child process, killing its process group and reaping it after
/// `timeout`.
pub async fn run(command: &CommandLine, timeout: Duration) -> CommandResult {
    let started = Instant::now();
    let deadline = started + timeout;
    debug!(%command, ?timeout, "executing (suspended)");

    let mut process = Command::new(command.program());
    process
        .args(command.get_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    process.process_group(0);

    let mut child = match process.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(%command, error = %e, "failed to spawn");
            return CommandResult::spawn_failure(command, &e);
        }
    };
    // Only `None` once the child has been polled to completion, which cannot have happened yet.
    let pid = child.id().unwrap_or_default();

    let output = OutputBuffer::default();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, output.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, output.clone()));
    }

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep_until(deadline) => None,
    };

    let result = match exited {
        Some(Ok(status)) => {
            if drain_until(&mut readers, deadline).await {
                CommandResult::exited(exit_code(status), output.contents(), pid)
            } else {
                // The child is gone but something it started still holds the pipes.
                warn!(%command, pid, ?timeout, "output still open at deadline, killing process group");
                kill_process_group(pid);
                abort_all(readers);
                CommandResult::timed_out(output.contents(), pid)
            }
        }
        Some(Err(e)) => {
            warn!(%command, pid, error = %e, "waiting on child failed");
            kill_process_group(pid);
            let _ = child.kill().await;
            abort_all(readers);
            CommandResult::spawn_failure(command, &e)
        }
        None => {
            warn!(%command, pid, ?timeout, "deadline exceeded, killing");
            kill_process_group(pid);
            // `kill` sends SIGKILL and then waits, which reaps the child.
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "kill failed");
            }
            abort_all(readers);
            CommandResult::timed_out(output.contents(), pid)
        }
    };

    debug!(
        %command,
        pid,
        status = result.status,
        timed_out = result.timed_out,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "command finished"
    );
    result
}

fn spawn_reader<R>(mut pipe: R, sink: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.append(&chunk[..n]),
            }
        }
    })
}

/// Wait for every reader to hit end-of-file, giving up at `deadline`.
async fn drain_until(readers: &mut [JoinHandle<()>], deadline: Instant) -> bool {
    for reader in readers.iter_mut() {
        if tokio::time::timeout_at(deadline, reader).await.is_err() {
            return false;
        }
    }
    true
}

fn abort_all(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        reader.abort();
    }
}

/// [`CommandRunner`] that suspends the calling task instead of blocking a thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactorExecutor;

#[async_trait]
impl CommandRunner for ReactorExecutor {
    async fn run(&self, command: &CommandLine, timeout: Duration) -> CommandResult {
        run(command, timeout).await
    }
}
