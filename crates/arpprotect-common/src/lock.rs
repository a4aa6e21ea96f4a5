//! Named serialization lock for rule engine mutations.
//!
//! ebtables is not safe under unserialized concurrent mutation, and every
//! reconciliation is a snapshot-then-mutate sequence. A [`ProtectionLock`]
//! makes that sequence atomic relative to other callers using the same
//! lock name:
//!
//! - within one process, through a registry of named async mutexes
//! - across processes, when a lock directory is configured, through an
//!   exclusive `flock(2)` on `<lock_dir>/<name>.lock`
//!
//! The lock is released when the [`LockGuard`] is dropped, on every exit path.

use nix::fcntl::{Flock, FlockArg};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{ProtectError, ProtectResult};

/// Default lock name shared by every mutating entry point.
pub const DEFAULT_LOCK_NAME: &str = "ebtables";

/// Process-wide registry: one async mutex per lock name.
static NAMED_LOCKS: Lazy<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn named_mutex(name: &str) -> Arc<AsyncMutex<()>> {
    NAMED_LOCKS
        .lock()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}

/// Handle to a named mutual-exclusion lock.
#[derive(Debug, Clone)]
pub struct ProtectionLock {
    name: String,
    local: Arc<AsyncMutex<()>>,
    lock_file: Option<PathBuf>,
}

impl ProtectionLock {
    /// Lock shared by every handle with the same name in this process.
    pub fn process_wide(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            local: named_mutex(&name),
            name,
            lock_file: None,
        }
    }

    /// Lock shared by every process on the host using the same directory and name.
    pub fn host_wide(name: impl Into<String>, lock_dir: impl AsRef<Path>) -> Self {
        let name = name.into();
        let lock_file = lock_dir.as_ref().join(format!("{name}.lock"));
        Self {
            local: named_mutex(&name),
            name,
            lock_file: Some(lock_file),
        }
    }

    /// Returns the lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the lock file path, if this lock is host-wide.
    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }

    /// Waits for the lock.
    ///
    /// The in-process mutex is taken first so that tasks of one process queue
    /// up on it instead of each blocking a thread in `flock(2)`.
    pub async fn acquire(&self) -> ProtectResult<LockGuard> {
        let local = self.local.clone().lock_owned().await;

        let file = match &self.lock_file {
            Some(path) => {
                let path = path.clone();
                let locked = tokio::task::spawn_blocking(move || lock_file_exclusive(&path))
                    .await
                    .map_err(|e| ProtectError::internal(format!("lock task failed: {e}")))?
                    .map_err(|e| ProtectError::lock(&self.name, e))?;
                Some(locked)
            }
            None => None,
        };

        tracing::trace!(lock = %self.name, "Acquired lock");
        Ok(LockGuard {
            _file: file,
            _local: local,
            name: self.name.clone(),
        })
    }
}

fn lock_file_exclusive(path: &Path) -> io::Result<Flock<File>> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| io::Error::from(errno))
}

/// Held lock; releases on drop.
pub struct LockGuard {
    // Field order matters: the file lock is released before the local mutex.
    _file: Option<Flock<File>>,
    _local: OwnedMutexGuard<()>,
    name: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::trace!(lock = %self.name, "Released lock");
    }
}
