//! Common infrastructure for the ebtables anti-spoofing reconciler.
//!
//! This crate provides the pieces that sit below the chain reconciler in
//! `arpprotectd` and that do not know anything about ebtables chains:
//!
//! - [`shell`]: the [`CommandRunner`] seam and its `tokio::process` implementation
//! - [`retry`]: the busy-status retry policy wrapped around every command
//! - [`lock`]: the named serialization lock held across snapshot-then-mutate
//! - [`error`]: error types shared by all of the above
//!
//! # Example
//!
//! ```ignore
//! use arpprotect_common::{
//!     lock::ProtectionLock,
//!     retry::{exec_with_retry, RetryPolicy},
//!     shell::ProcessRunner,
//! };
//!
//! let lock = ProtectionLock::process_wide("ebtables");
//! let _guard = lock.acquire().await?;
//! let argv = vec!["ebtables".to_string(), "-t".into(), "nat".into(), "-L".into()];
//! let listing = exec_with_retry(&ProcessRunner, &argv, &RetryPolicy::default()).await?;
//! ```

pub mod error;
pub mod lock;
pub mod retry;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{ProtectError, ProtectResult};
pub use lock::{LockGuard, ProtectionLock};
pub use retry::{exec_with_retry, RetryPolicy};
pub use shell::{CommandRunner, ExecResult, ProcessRunner};
