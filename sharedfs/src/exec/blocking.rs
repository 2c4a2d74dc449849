//! Blocking execution: the caller's thread waits for the process.

use super::{CommandLine, CommandResult, CommandRunner, OutputBuffer, exit_code, kill_process_group, retry::RetryPolicy};
use async_trait::async_trait;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Run `command` on the current thread, killing its process group and reaping it after
/// `timeout`. The deadline also bounds how long the output pipes may stay open.
pub fn run(command: &CommandLine, timeout: Duration) -> CommandResult {
    let started = Instant::now();
    let deadline = started + timeout;
    debug!(%command, ?timeout, "executing (blocking)");

    let mut process = Command::new(command.program());
    process
        .args(command.get_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        process.process_group(0);
    }

    let mut child = match process.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(%command, error = %e, "failed to spawn");
            return CommandResult::spawn_failure(command, &e);
        }
    };
    let pid = child.id();

    let output = OutputBuffer::default();
    let (done_tx, done_rx) = mpsc::channel();
    let mut readers = 0;
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, output.clone(), done_tx.clone());
        readers += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, output.clone(), done_tx.clone());
        readers += 1;
    }
    drop(done_tx);

    let result = match child.wait_timeout(timeout) {
        Ok(Some(status)) => {
            if drain_until(&done_rx, readers, deadline) {
                CommandResult::exited(exit_code(status), output.contents(), pid)
            } else {
                // The child is gone but something it started still holds the pipes.
                warn!(%command, pid, ?timeout, "output still open at deadline, killing process group");
                kill_process_group(pid);
                CommandResult::timed_out(output.contents(), pid)
            }
        }
        Ok(None) => {
            warn!(%command, pid, ?timeout, "deadline exceeded, killing");
            kill_process_group(pid);
            if let Err(e) = child.kill() {
                warn!(pid, error = %e, "kill failed");
            }
            // Reap so the child does not linger as a zombie.
            if let Err(e) = child.wait() {
                warn!(pid, error = %e, "wait after kill failed");
            }
            CommandResult::timed_out(output.contents(), pid)
        }
        Err(e) => {
            warn!(%command, pid, error = %e, "waiting on child failed");
            kill_process_group(pid);
            let _ = child.kill();
            let _ = child.wait();
            CommandResult::spawn_failure(command, &e)
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

/// Wait for `readers` end-of-file notifications, giving up at `deadline`.
fn drain_until(done: &Receiver<()>, readers: usize, deadline: Instant) -> bool {
    for _ in 0..readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            // Disconnected: every reader has finished or died.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
    true
}

/// Run `command` under `policy`, sleeping the thread between attempts.
pub fn run_with_retry(command: &CommandLine, timeout: Duration, policy: RetryPolicy) -> CommandResult {
    retry_blocking(policy, || run(command, timeout))
}

/// Drive `attempt` until it succeeds or the policy's attempt budget is spent.
pub fn retry_blocking<F>(policy: RetryPolicy, mut attempt: F) -> CommandResult
where
    F: FnMut() -> CommandResult,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut n = 1;
    loop {
        let result = attempt();
        if result.success() || n >= max_attempts {
            return result;
        }
        debug!(
            attempt = n,
            max_attempts,
            delay = ?policy.delay,
            output = %result.output,
            "command failed, retrying"
        );
        thread::sleep(policy.delay);
        n += 1;
    }
}

fn spawn_reader<R>(mut pipe: R, sink: OutputBuffer, done: Sender<()>)
where
    R: Read + Send + 'static,
{
    // Left detached: a background process may keep the pipe open past the deadline.
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink.append(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = done.send(());
    });
}

/// [`CommandRunner`] that blocks the worker thread for the lifetime of each process.
///
/// On a multi-threaded runtime the worker is handed over with `block_in_place` so other tasks
/// move to the remaining workers. Anywhere else the work simply runs on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingExecutor;

fn block<R>(work: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

#[async_trait]
impl CommandRunner for BlockingExecutor {
    async fn run(&self, command: &CommandLine, timeout: Duration) -> CommandResult {
        block(|| run(command, timeout))
    }

    async fn pause(&self, delay: Duration) {
        block(|| thread::sleep(delay));
    }
}
