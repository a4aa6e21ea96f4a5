//! Retry policy for rule engine commands.
//!
//! ebtables reports a dedicated exit status when another process holds its
//! table lock (`--concurrent`). Only that status is retried, with
//! exponential backoff; every other non-zero exit fails immediately.

use std::time::{Duration, Instant};

use crate::error::{ProtectError, ProtectResult};
use crate::shell::{command_line, CommandRunner};

/// Exit status ebtables uses for concurrent modification.
pub const EBTABLES_BUSY_EXIT_CODE: i32 = 255;

/// First backoff delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(20);

/// Upper bound for a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for the total time spent retrying one command.
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(30);

/// When and how long to wait before re-running a busy command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Exit code that means "busy, try again".
    pub busy_exit_code: i32,
    /// Delay before the first retry; doubled on every subsequent one.
    pub initial_backoff: Duration,
    /// Cap for a single delay.
    pub max_backoff: Duration,
    /// Total retry budget; exceeding it yields [`ProtectError::RetryTimeout`].
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            busy_exit_code: EBTABLES_BUSY_EXIT_CODE,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_elapsed: DEFAULT_MAX_ELAPSED,
        }
    }
}

impl RetryPolicy {
    /// Returns true if a command that exited with `exit_code` should be re-run.
    pub fn should_retry(&self, exit_code: i32) -> bool {
        exit_code == self.busy_exit_code
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Runs `argv` until it succeeds, fails for good, or the retry budget runs out.
///
/// Returns the command's stdout on success.
pub async fn exec_with_retry(
    runner: &dyn CommandRunner,
    argv: &[String],
    policy: &RetryPolicy,
) -> ProtectResult<String> {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let result = runner.run(argv).await?;
        if result.success() {
            return Ok(result.stdout);
        }

        let command = command_line(argv);
        if !policy.should_retry(result.exit_code) {
            tracing::warn!(
                command = %command,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "Command failed"
            );
            return Err(ProtectError::CommandFailed {
                command,
                exit_code: result.exit_code,
                output: result.combined_output(),
            });
        }

        let delay = policy.backoff(attempt);
        attempt += 1;
        if started.elapsed() + delay > policy.max_elapsed {
            tracing::warn!(command = %command, attempts = attempt, "Rule engine still busy, giving up");
            return Err(ProtectError::RetryTimeout {
                command,
                attempts: attempt,
                elapsed: started.elapsed(),
            });
        }

        tracing::debug!(
            command = %command,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Rule engine busy, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::ExecResult;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed list of exit codes, then succeeds forever.
    struct ScriptedRunner {
        script: Mutex<VecDeque<i32>>,
        calls: Mutex<u32>,
    }

    impl ScriptedRunner {
        fn new(codes: &[i32]) -> Self {
            Self {
                script: Mutex::new(codes.iter().copied().collect()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _argv: &[String]) -> ProtectResult<ExecResult> {
            *self.calls.lock() += 1;
            match self.script.lock().pop_front() {
                Some(code) => Ok(ExecResult::failed(code, "scripted failure")),
                None => Ok(ExecResult::ok("done")),
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_elapsed: Duration::from_secs(5),
            ..RetryPolicy::default()
        }
    }

    fn argv() -> Vec<String> {
        vec!["ebtables".to_string(), "-L".to_string()]
    }

    #[test]
    fn test_should_retry_only_busy_code() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(255));
        assert!(!policy.should_retry(1));
        assert!(!policy.should_retry(0));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(20));
        assert_eq!(policy.backoff(1), Duration::from_millis(40));
        assert_eq!(policy.backoff(2), Duration::from_millis(80));
        assert_eq!(policy.backoff(10), Duration::from_secs(1));
        assert_eq!(policy.backoff(64), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_recovers_after_two_busy_exits() {
        let runner = ScriptedRunner::new(&[255, 255]);
        let out = exec_with_retry(&runner, &argv(), &fast_policy()).await.unwrap();
        assert_eq!(out, "done");
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn test_other_exit_code_is_fatal() {
        let runner = ScriptedRunner::new(&[1]);
        let err = exec_with_retry(&runner, &argv(), &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_busy_forever_times_out() {
        let runner = ScriptedRunner::new(&[255; 1000]);
        let policy = RetryPolicy {
            max_elapsed: Duration::from_millis(20),
            ..fast_policy()
        };
        let err = exec_with_retry(&runner, &argv(), &policy).await.unwrap_err();
        match err {
            ProtectError::RetryTimeout { attempts, .. } => assert!(attempts >= 1),
            other => panic!("Expected RetryTimeout, got {other:?}"),
        }
    }
}
