//! Configuration file support for arpprotectd
//!
//! Loads and validates the reconciler configuration from TOML files.
//! Default location: /etc/arpprotect/arpprotectd.toml

use arpprotect_common::lock::{ProtectionLock, DEFAULT_LOCK_NAME};
use arpprotect_common::retry::{RetryPolicy, EBTABLES_BUSY_EXIT_CODE};
use arpprotect_common::shell::{EBTABLES_CMD, SUDO_CMD};
use arpprotect_common::{ProtectError, ProtectResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::executor::EbtablesSettings;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/arpprotect/arpprotectd.toml";

/// How the rule engine is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EbtablesConfig {
    /// Rule engine binary
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Privilege helper prepended to every command; empty when running as root
    #[serde(default = "default_root_helper")]
    pub root_helper: Vec<String>,

    /// Network namespace to run every command in
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Busy-status retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Exit code that means the engine is busy
    #[serde(default = "default_busy_exit_code")]
    pub busy_exit_code: i32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Cap for a single backoff delay in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Total retry budget per command in milliseconds
    #[serde(default = "default_max_elapsed")]
    pub max_elapsed_ms: u64,
}

/// Serialization lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock name shared by all mutating entry points
    #[serde(default = "default_lock_name")]
    pub name: String,

    /// Directory for host-wide lock files; unset or empty means process-wide only
    #[serde(default = "default_lock_dir")]
    pub lock_dir: Option<PathBuf>,
}

/// Complete arpprotectd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArpProtectConfig {
    /// Rule engine invocation
    #[serde(default)]
    pub ebtables: EbtablesConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Serialization lock
    #[serde(default)]
    pub lock: LockConfig,

    /// Timeout around each locked critical section, in seconds
    #[serde(default)]
    pub operation_timeout_secs: Option<u64>,
}

// Default functions
fn default_binary() -> String {
    EBTABLES_CMD.to_string()
}

fn default_root_helper() -> Vec<String> {
    vec![SUDO_CMD.to_string()]
}

fn default_busy_exit_code() -> i32 {
    EBTABLES_BUSY_EXIT_CODE
}

fn default_initial_backoff() -> u64 {
    20
}

fn default_max_backoff() -> u64 {
    1000
}

fn default_max_elapsed() -> u64 {
    30_000
}

fn default_lock_name() -> String {
    DEFAULT_LOCK_NAME.to_string()
}

fn default_lock_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/run/lock/arpprotect"))
}

impl Default for EbtablesConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            root_helper: default_root_helper(),
            namespace: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            busy_exit_code: default_busy_exit_code(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_elapsed_ms: default_max_elapsed(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: default_lock_name(),
            lock_dir: default_lock_dir(),
        }
    }
}

impl ArpProtectConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> ProtectResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).map_err(|e| {
                ProtectError::invalid_config(path.display().to_string(), e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ProtectError::invalid_config(
                path.display().to_string(),
                format!("Failed to read config file: {e}"),
            )),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> ProtectResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Validate configuration
    pub fn validate(&self) -> ProtectResult<()> {
        if self.ebtables.binary.trim().is_empty() {
            return Err(ProtectError::invalid_config(
                "ebtables.binary",
                "must not be empty",
            ));
        }

        if self.ebtables.namespace.as_deref().is_some_and(str::is_empty) {
            return Err(ProtectError::invalid_config(
                "ebtables.namespace",
                "must not be empty when set",
            ));
        }

        if self.retry.busy_exit_code == 0 {
            return Err(ProtectError::invalid_config(
                "retry.busy_exit_code",
                "must be non-zero",
            ));
        }

        if self.retry.initial_backoff_ms == 0 {
            return Err(ProtectError::invalid_config(
                "retry.initial_backoff_ms",
                "must be > 0",
            ));
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(ProtectError::invalid_config(
                "retry.max_backoff_ms",
                "must be >= initial_backoff_ms",
            ));
        }

        if self.lock.name.is_empty() || self.lock.name.contains('/') {
            return Err(ProtectError::invalid_config(
                "lock.name",
                "must be a non-empty file name",
            ));
        }

        if self.operation_timeout_secs == Some(0) {
            return Err(ProtectError::invalid_config(
                "operation_timeout_secs",
                "must be > 0 when set",
            ));
        }

        Ok(())
    }

    /// Get the retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            busy_exit_code: self.retry.busy_exit_code,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            max_elapsed: Duration::from_millis(self.retry.max_elapsed_ms),
        }
    }

    /// Get the rule engine invocation settings
    pub fn ebtables_settings(&self) -> EbtablesSettings {
        EbtablesSettings {
            binary: self.ebtables.binary.clone(),
            root_helper: self.ebtables.root_helper.clone(),
            namespace: self.ebtables.namespace.clone(),
        }
    }

    /// Get the serialization lock handle
    pub fn protection_lock(&self) -> ProtectionLock {
        match self.lock.lock_dir.as_deref() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                ProtectionLock::host_wide(self.lock.name.clone(), dir)
            }
            _ => ProtectionLock::process_wide(self.lock.name.clone()),
        }
    }

    /// Get operation timeout as Duration
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }
}
