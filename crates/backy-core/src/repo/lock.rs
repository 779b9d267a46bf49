//! Repository locking.
//!
//! One flock-style lock file (`.backy.lock`) per repository. Mutating
//! operations take it exclusively and fail fast when contended; read-only
//! operations (status, restore) take it shared. The guard releases the
//! lock on every exit path, including panics and early returns.

use std::fs::{File, OpenOptions};
use std::path::Path;

use tracing::warn;

use backy_types::{BackyError, Result};

use crate::platform::{self, LockMode};

pub const LOCK_FILE: &str = ".backy.lock";

/// Handle to a held repository lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    mode: LockMode,
}

impl RepoLock {
    /// Take the exclusive lock without blocking. Another holder means
    /// another backy is working on this repository: fail fast.
    pub fn exclusive(repo_path: &Path) -> Result<Self> {
        Self::acquire(repo_path, LockMode::Exclusive)
    }

    /// Take the shared lock without blocking.
    pub fn shared(repo_path: &Path) -> Result<Self> {
        Self::acquire(repo_path, LockMode::Shared)
    }

    fn acquire(repo_path: &Path, mode: LockMode) -> Result<Self> {
        let path = repo_path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match platform::flock(&file, mode) {
            Ok(()) => Ok(RepoLock { file, mode }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!(lock = %path.display(), "repository lock is held elsewhere");
                Err(BackyError::LockHeld(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = platform::funlock(&self.file) {
            warn!(error = %e, "failed to release repository lock");
        }
    }
}
