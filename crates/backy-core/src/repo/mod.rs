//! Repository: the ordered revision history of one source volume plus its
//! owning chunk store and quarantine.
//!
//! Locking strategy: the repository itself is lock-free; the operations in
//! [`crate::ops`] (and the expiry path) take `.backy.lock` exclusively for
//! anything mutating and shared for read-only work. Locking is not
//! re-entrant, so primitives here never lock on their own.

pub mod format;
pub mod lock;

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use backy_types::{BackyError, ChunkId, Result};

use crate::quarantine::QuarantineStore;
use crate::revision::{Revision, Trust};
use crate::store::ChunkStore;

use self::format::ChunkMap;

/// Tag edit operations, applied under the exclusive lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagAction {
    Set,
    Add,
    Remove,
}

pub struct Repository {
    path: PathBuf,
    pub store: ChunkStore,
    pub quarantine: QuarantineStore,
    /// All known revisions, oldest first.
    history: Vec<Revision>,
}

impl Repository {
    /// Open a repository directory, creating the chunk store and
    /// quarantine scaffolding if needed, and scan the revision history.
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let store = ChunkStore::open(&path.join("chunks"))?;
        let quarantine = QuarantineStore::open(path)?;
        let mut repo = Repository {
            path: path.to_path_buf(),
            store,
            quarantine,
            history: Vec::new(),
        };
        repo.scan()?;
        repo.refresh_paranoia();
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Re-read all revision metadata from disk. Oldest first.
    pub fn scan(&mut self) -> Result<()> {
        let mut history = Vec::new();
        let mut seen = HashSet::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(uuid) = name.strip_suffix(".rev") else {
                continue;
            };
            match Revision::load(&entry.path()) {
                Ok(rev) => {
                    if seen.insert(rev.uuid.clone()) {
                        if rev.uuid != uuid {
                            warn!(
                                file = name,
                                uuid = %rev.uuid,
                                "revision file name does not match its uuid"
                            );
                        }
                        history.push(rev);
                    }
                }
                Err(e) => warn!(file = name, error = %e, "skipping unreadable revision"),
            }
        }
        history.sort_by_key(|r| r.timestamp);
        self.history = history;
        Ok(())
    }

    pub fn history(&self) -> &[Revision] {
        &self.history
    }

    /// Completed revisions only, oldest first.
    pub fn clean_history(&self) -> impl Iterator<Item = &Revision> {
        self.history.iter().filter(|r| r.is_complete())
    }

    /// The newest completed revision: the parent of the next backup.
    pub fn latest_completed(&self) -> Option<&Revision> {
        self.clean_history().last()
    }

    /// Distrust floor: is any completed revision currently distrusted?
    pub fn contains_distrusted(&self) -> bool {
        self.clean_history().any(|r| r.trust == Trust::Distrusted)
    }

    /// Put the chunk store into (or out of) paranoid mode to match the
    /// current distrust state.
    pub fn refresh_paranoia(&mut self) {
        let distrusted = self.contains_distrusted();
        self.store.set_force_writes(distrusted);
    }

    pub fn get(&self, uuid: &str) -> Option<&Revision> {
        self.history.iter().find(|r| r.uuid == uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut Revision> {
        self.history.iter_mut().find(|r| r.uuid == uuid)
    }

    /// Register a freshly persisted revision in the in-memory history.
    pub fn add(&mut self, revision: Revision) {
        self.history.push(revision);
        self.history.sort_by_key(|r| r.timestamp);
    }

    /// Load the packed chunk map of a revision.
    pub fn load_map(&self, uuid: &str) -> Result<ChunkMap> {
        format::read_map(&self.path, uuid)
    }

    // ----- Revision selection -----

    /// Resolve a single-revision specifier: full uuid, non-negative
    /// integer (N-th newest completed, 0 = newest), `latest`/`last`, or
    /// a tag (newest completed revision bearing it).
    pub fn find(&self, spec: &str) -> Result<&Revision> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(BackyError::RevisionNotFound(spec.into()));
        }
        if let Ok(n) = spec.parse::<usize>() {
            let completed: Vec<&Revision> = self.clean_history().collect();
            return completed
                .iter()
                .rev()
                .nth(n)
                .copied()
                .ok_or_else(|| BackyError::RevisionNotFound(spec.into()));
        }
        if spec == "latest" || spec == "last" {
            return self
                .latest_completed()
                .ok_or_else(|| BackyError::RevisionNotFound(spec.into()));
        }
        if let Some(rev) = self.get(spec) {
            return Ok(rev);
        }
        // A tag resolves to the newest completed revision bearing it.
        self.clean_history()
            .filter(|r| r.tags.contains(spec))
            .last()
            .ok_or_else(|| BackyError::RevisionNotFound(spec.into()))
    }

    /// Resolve a multi-revision specifier: everything [`find`] accepts,
    /// plus `all`. Returns uuids, oldest first.
    pub fn find_revisions(&self, spec: &str) -> Result<Vec<String>> {
        if spec.trim() == "all" {
            return Ok(self.history.iter().map(|r| r.uuid.clone()).collect());
        }
        Ok(vec![self.find(spec)?.uuid.clone()])
    }

    // ----- Mutation primitives (caller holds the exclusive lock) -----

    /// Remove a revision's files and drop it from the history.
    pub fn forget(&mut self, uuid: &str) -> Result<()> {
        let Some(pos) = self.history.iter().position(|r| r.uuid == uuid) else {
            return Err(BackyError::RevisionNotFound(uuid.into()));
        };
        let rev = self.history.remove(pos);
        rev.remove(&self.path)?;
        Ok(())
    }

    /// Remove incomplete revisions left over from a crashed backup run.
    pub fn clean_incomplete(&mut self) -> Result<()> {
        let stale: Vec<String> = self
            .history
            .iter()
            .filter(|r| !r.is_complete())
            .map(|r| r.uuid.clone())
            .collect();
        for uuid in stale {
            warn!(revision = %uuid, "removing incomplete revision");
            self.forget(&uuid)?;
        }
        Ok(())
    }

    /// Mark every revision distrusted. Called when any chunk fails its
    /// content hash: one bad chunk means the store as a whole can no
    /// longer be trusted.
    pub fn distrust_all(&mut self) -> Result<()> {
        warn!(repository = %self.name(), "integrity failure, distrusting all revisions");
        let path = self.path.clone();
        for rev in &mut self.history {
            if rev.trust != Trust::Distrusted {
                rev.distrust();
                rev.write_info(&path)?;
            }
        }
        self.refresh_paranoia();
        Ok(())
    }

    /// Edit the tag set of the selected revisions. Untagged revisions are
    /// removed when `autoremove` is set.
    pub fn edit_tags(
        &mut self,
        spec: &str,
        action: TagAction,
        tags: &BTreeSet<String>,
        autoremove: bool,
    ) -> Result<()> {
        let path = self.path.clone();
        let uuids = self.find_revisions(spec)?;
        let mut removed = Vec::new();
        for uuid in &uuids {
            let rev = self
                .get_mut(uuid)
                .expect("selection returned a known uuid");
            match action {
                TagAction::Set => rev.tags = tags.clone(),
                TagAction::Add => rev.tags.extend(tags.iter().cloned()),
                TagAction::Remove => {
                    rev.tags.retain(|t| !tags.contains(t));
                }
            }
            if rev.tags.is_empty() && autoremove {
                removed.push(uuid.clone());
            } else {
                rev.write_info(&path)?;
            }
        }
        for uuid in removed {
            self.forget(&uuid)?;
        }
        Ok(())
    }

    // ----- Garbage collection -----

    /// The set of chunk ids referenced by any revision on disk.
    pub fn live_chunks(&self) -> Result<HashSet<ChunkId>> {
        let mut live = HashSet::new();
        for rev in &self.history {
            match self.load_map(&rev.uuid) {
                Ok(map) => live.extend(map.values().copied()),
                Err(BackyError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    // An in-progress revision has no map yet.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(live)
    }

    /// Reindex the store and drop every chunk no revision references.
    pub fn purge(&mut self) -> Result<usize> {
        let live = self.live_chunks()?;
        let removed = self.store.purge(&live)?;
        if removed > 0 {
            info!(removed, "purge finished");
        }
        Ok(removed)
    }
}
