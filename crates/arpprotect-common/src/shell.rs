//! Command execution for the rule engine.
//!
//! Commands are executed directly from an argument vector, never through a
//! shell. [`shellquote`] and [`command_line`] only exist to render an argv as
//! a copy-pasteable string for logs and error messages.
//!
//! # Example
//!
//! ```ignore
//! use arpprotect_common::shell::{CommandRunner, ProcessRunner};
//!
//! let argv = vec!["ebtables".to_string(), "-t".into(), "nat".into(), "-L".into()];
//! let result = ProcessRunner.run(&argv).await?;
//! if result.success() {
//!     println!("{}", result.stdout);
//! }
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{ProtectError, ProtectResult};

/// Path to the `ip` command, used to enter a network namespace.
pub const IP_CMD: &str = "/sbin/ip";

/// Default rule engine binary.
pub const EBTABLES_CMD: &str = "ebtables";

/// Default privilege escalation helper.
pub const SUDO_CMD: &str = "sudo";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Arguments made only of these characters are rendered unquoted.
static SHELL_SAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_@%+=:,./-]+$").expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\` and
/// newline.
///
/// # Example
///
/// ```
/// use arpprotect_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "\"simple\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Renders an argument vector as a single command line.
///
/// Plain arguments are left as they are; anything else goes through
/// [`shellquote`].
pub fn command_line<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if SHELL_SAFE_RE.is_match(arg) {
                arg.to_string()
            } else {
                shellquote(arg)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Creates a successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Creates a failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs a privileged command and reports its exit status.
///
/// A non-zero exit is not an error at this layer; only a failure to run the
/// command at all is. Interpreting exit codes belongs to the retry policy.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `argv[0]` with the remaining arguments.
    async fn run(&self, argv: &[String]) -> ProtectResult<ExecResult>;
}

/// [`CommandRunner`] that spawns real processes with `tokio::process`.
///
/// Dropping the returned future kills the child, so a cancelled call never
/// mutates state after its caller has released the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String]) -> ProtectResult<ExecResult> {
        let cmd = command_line(argv);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProtectError::internal("empty command line"))?;

        tracing::debug!(command = %cmd, "Executing command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProtectError::ShellExec {
                command: cmd.clone(),
                source: e,
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let result = ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if result.success() {
            tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
        } else {
            tracing::debug!(
                command = %cmd,
                exit_code = exit_code,
                stderr = %result.stderr,
                "Command exited non-zero"
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hello\""), "\"say \\\"hello\\\"\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_command_line_plain() {
        let cmd = command_line(&argv(&[
            "ebtables",
            "-t",
            "nat",
            "--concurrent",
            "-A",
            "neutronMAC-tap1",
            "--among-src",
            "fa:16:3e:00:00:01,fa:16:3e:00:00:02",
        ]));
        assert_eq!(
            cmd,
            "ebtables -t nat --concurrent -A neutronMAC-tap1 --among-src fa:16:3e:00:00:01,fa:16:3e:00:00:02"
        );
    }

    #[test]
    fn test_command_line_quotes_unsafe_args() {
        let cmd = command_line(&argv(&["ebtables", "-i", "tap1; rm -rf /"]));
        assert_eq!(cmd, "ebtables -i \"tap1; rm -rf /\"");
    }

    #[test]
    fn test_exec_result_combined() {
        assert_eq!(ExecResult::ok("out").combined_output(), "out");
        assert_eq!(ExecResult::failed(1, "err").combined_output(), "err");
        let both = ExecResult {
            exit_code: 0,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert_eq!(both.combined_output(), "stdout\nstderr");
    }

    #[tokio::test]
    async fn test_process_runner_echo() {
        let result = ProcessRunner.run(&argv(&["echo", "hello"])).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_process_runner_exit_code() {
        let result = ProcessRunner
            .run(&argv(&["sh", "-c", "exit 42"]))
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_process_runner_missing_binary() {
        let result = ProcessRunner
            .run(&argv(&["/nonexistent/ebtables-binary"]))
            .await;
        assert!(matches!(result, Err(ProtectError::ShellExec { .. })));
    }

    #[tokio::test]
    async fn test_process_runner_empty_argv() {
        let result = ProcessRunner.run(&[]).await;
        assert!(matches!(result, Err(ProtectError::Internal { .. })));
    }

    #[tokio::test]
    async fn test_process_runner_kills_child_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 0.3; touch {}", marker.display());

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ProcessRunner.run(&argv(&["sh", "-c", &script])),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert!(!marker.exists());
    }
}
