//! Top-level repository operations.
//!
//! Each operation acquires the repository lock itself (exclusive for
//! mutation, shared for reads); the primitives in [`crate::repo`] stay
//! lock-free because locking is not re-entrant.

pub mod backup;
pub mod restore;
pub mod verify;

pub use backup::backup;
pub use restore::{restore, RestoreTarget};
pub use verify::verify;

use std::collections::BTreeSet;

use backy_types::Result;

use crate::repo::lock::RepoLock;
use crate::repo::{Repository, TagAction};
use crate::schedule::Schedule;

/// Remove the selected revisions under the exclusive lock.
pub fn forget(repo: &mut Repository, spec: &str) -> Result<()> {
    let _lock = RepoLock::exclusive(repo.path())?;
    repo.scan()?;
    for uuid in repo.find_revisions(spec)? {
        repo.forget(&uuid)?;
    }
    Ok(())
}

/// Run tag expiry, then collect orphaned chunks.
pub fn expire(repo: &mut Repository, schedule: &Schedule) -> Result<Vec<String>> {
    let _lock = RepoLock::exclusive(repo.path())?;
    repo.scan()?;
    let removed = schedule.expire(repo)?;
    repo.purge()?;
    Ok(removed)
}

/// Garbage-collect unreferenced chunks under the exclusive lock.
pub fn purge(repo: &mut Repository) -> Result<usize> {
    let _lock = RepoLock::exclusive(repo.path())?;
    repo.scan()?;
    repo.purge()
}

/// Edit revision tags under the exclusive lock. Non-`manual:` tags must
/// exist in the schedule unless `force` is set.
pub fn edit_tags(
    repo: &mut Repository,
    schedule: &Schedule,
    spec: &str,
    action: TagAction,
    tags: &BTreeSet<String>,
    autoremove: bool,
    force: bool,
) -> Result<()> {
    let _lock = RepoLock::exclusive(repo.path())?;
    repo.scan()?;
    if !force && action != TagAction::Remove {
        schedule.validate_tags(tags.iter())?;
    }
    repo.edit_tags(spec, action, tags, autoremove)
}
