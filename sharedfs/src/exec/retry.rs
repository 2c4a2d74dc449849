//! Bounded fixed-delay retries.

use super::{CommandLine, CommandResult, CommandRunner};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How many times a command may be attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// A single attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `command` through `runner` until it succeeds or `policy` is exhausted.
///
/// Any unsuccessful result counts as a failure, timeouts included. The last
/// result is returned unchanged once the attempts run out. Between attempts the
/// runner's own [`CommandRunner::pause`] is used, so a blocking runner sleeps its
/// thread and a suspended one yields to the scheduler.
pub async fn run_with_retry(
    runner: &dyn CommandRunner,
    command: &CommandLine,
    timeout: Duration,
    policy: RetryPolicy,
) -> CommandResult {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = runner.run(command, timeout).await;
        if result.success() || attempt >= max_attempts {
            return result;
        }
        debug!(
            %command,
            attempt,
            max_attempts,
            delay = ?policy.delay,
            output = %result.output,
            "command failed, retrying"
        );
        runner.pause(policy.delay).await;
        attempt += 1;
    }
}
