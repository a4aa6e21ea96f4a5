//! Error types for anti-spoofing operations.
//!
//! All errors implement `std::error::Error` via `thiserror`. A failed call
//! leaves no rollback obligations behind: the next call re-reads the live
//! rule state and converges again.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for anti-spoofing operations.
pub type ProtectResult<T> = Result<T, ProtectError>;

/// Errors that can occur while reconciling ebtables state.
#[derive(Debug, Error)]
pub enum ProtectError {
    /// Failed to spawn the command at all.
    #[error("Failed to execute command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The rule engine returned a non-retryable, non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// The rule engine kept reporting concurrent modification past the
    /// retry budget.
    #[error("Command '{command}' still busy after {attempts} attempts over {elapsed:?}")]
    RetryTimeout {
        /// The command that was retried.
        command: String,
        /// Number of attempts made.
        attempts: u32,
        /// Total time spent retrying.
        elapsed: Duration,
    },

    /// The host-wide lock file could not be opened or locked.
    #[error("Failed to acquire lock '{name}': {source}")]
    Lock {
        /// The lock name.
        name: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A caller-side timeout elapsed around a locked critical section.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A port policy that cannot be turned into rules.
    #[error("Invalid policy for '{vif}': {message}")]
    InvalidPolicy {
        /// The vif the policy was supplied for.
        vif: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ProtectError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid policy error.
    pub fn invalid_policy(vif: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            vif: vif.into(),
            message: message.into(),
        }
    }

    /// Creates a lock error.
    pub fn lock(name: impl Into<String>, source: io::Error) -> Self {
        Self::Lock {
            name: name.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the exit code reported by the rule engine, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProtectError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Returns true if re-invoking the whole call later may succeed.
    ///
    /// Every failure except bad input qualifies, since each call
    /// re-derives state from the live listing.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProtectError::InvalidConfig { .. } | ProtectError::InvalidPolicy { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = ProtectError::CommandFailed {
            command: "ebtables -t nat --concurrent -X neutronARP-tap1".to_string(),
            exit_code: 1,
            output: "Chain neutronARP-tap1 is in use".to_string(),
        };
        assert!(err.to_string().contains("-X neutronARP-tap1"));
        assert!(err.to_string().contains("exit code 1"));
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_retry_timeout_display() {
        let err = ProtectError::RetryTimeout {
            command: "ebtables -L".to_string(),
            attempts: 7,
            elapsed: Duration::from_millis(2540),
        };
        assert!(err.to_string().contains("7 attempts"));
        assert_eq!(err.exit_code(), None);
    }

    #[test]
    fn test_invalid_config() {
        let err = ProtectError::invalid_config("retry.initial_backoff_ms", "must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for retry.initial_backoff_ms: must be > 0"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_retryable() {
        assert!(ProtectError::internal("bug").is_retryable());
        assert!(ProtectError::timeout("setup_protection", Duration::from_secs(5)).is_retryable());
        assert!(!ProtectError::invalid_policy("tap1", "bad MAC").is_retryable());
    }
}
