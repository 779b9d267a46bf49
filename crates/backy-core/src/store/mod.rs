//! Content-addressed chunk store.
//!
//! One store per repository. Chunks live at
//! `<store>/chunks/<aa>/<id>.chunk.lzo` where `aa` is the first two hex
//! chars of the id and the payload is the LZO-compressed plaintext. Chunks
//! are never rewritten in place: they are created by atomic rename or
//! deleted, nothing else.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use backy_types::{BackyError, ChunkId, Result};

use crate::compress;
use crate::platform;

const CHUNK_SUFFIX: &str = ".chunk.lzo";
const VERSION_STAMP: &str = "store";
const STORE_VERSION: &str = "v2";

/// Deletions are bundled so directory metadata is flushed once per batch
/// rather than once per unlink.
const UNLINK_BATCH: usize = 1024;

/// Outcome of a [`ChunkStore::put`], used for backup statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// The chunk was already present and the index was trusted.
    Reused,
    /// A chunk file was written.
    Written,
}

pub struct ChunkStore {
    path: PathBuf,
    known: HashSet<ChunkId>,
    /// Paranoid mode: never trust the index, always write and read back.
    /// Active while any revision of the owning repository is distrusted.
    force_writes: bool,
    /// Chunks already force-written during the current backup run.
    seen_forced: HashSet<ChunkId>,
}

impl ChunkStore {
    /// Open (creating if necessary) the chunk store at `path` and build
    /// the in-memory id index from disk.
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        for shard in 0u16..256 {
            let dir = path.join(format!("{shard:02x}"));
            if !dir.exists() {
                fs::create_dir(&dir)?;
            }
        }

        let stamp = path.join(VERSION_STAMP);
        if stamp.exists() {
            let version = fs::read_to_string(&stamp)?;
            if version.trim() != STORE_VERSION {
                return Err(BackyError::InvalidFormat(format!(
                    "unknown chunk store version '{}'",
                    version.trim()
                )));
            }
        } else {
            fs::write(&stamp, STORE_VERSION)?;
        }

        let mut store = ChunkStore {
            path: path.to_path_buf(),
            known: HashSet::new(),
            force_writes: false,
            seen_forced: HashSet::new(),
        };
        store.scan()?;
        info!(chunks = store.known.len(), "chunk store loaded");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full path of the chunk file for `id`.
    pub fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_hex();
        self.path
            .join(id.shard_prefix())
            .join(format!("{hex}{CHUNK_SUFFIX}"))
    }

    /// Enable or disable paranoid mode. Enabling clears nothing; the
    /// per-run `seen_forced` set still short-circuits duplicate writes
    /// within one backup.
    pub fn set_force_writes(&mut self, force: bool) {
        if force && !self.force_writes {
            warn!("distrusted revisions present, forcing full chunk writes");
        }
        self.force_writes = force;
    }

    pub fn force_writes(&self) -> bool {
        self.force_writes
    }

    /// Forget the per-run forced-write memory. Called at backup start.
    pub fn begin_run(&mut self) {
        self.seen_forced.clear();
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.known.contains(id)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Store a chunk. Idempotent: the same plaintext always maps to the
    /// same id and at most one file.
    ///
    /// Outside paranoid mode a known id returns without touching disk.
    /// In paranoid mode every id is written once per run and read back
    /// for verification.
    pub fn put(&mut self, data: &[u8]) -> Result<(ChunkId, PutResult)> {
        let id = ChunkId::compute(data);

        let needs_forced_write = self.force_writes && !self.seen_forced.contains(&id);
        if self.known.contains(&id) && !needs_forced_write {
            return Ok((id, PutResult::Reused));
        }

        self.write_chunk(&id, data)?;

        if self.force_writes {
            // Read back through the regular path so the hash check runs.
            let verify = self.get(&id)?;
            if verify != data {
                return Err(BackyError::Integrity(id));
            }
            self.seen_forced.insert(id);
        }

        self.known.insert(id);
        Ok((id, PutResult::Written))
    }

    fn write_chunk(&self, id: &ChunkId, data: &[u8]) -> Result<()> {
        let target = self.chunk_path(id);
        let dir = target.parent().expect("chunk path has a shard directory");

        // Create the temp file next to the target: the rename stays within
        // one directory and a concurrent `put` of the same id races safely
        // because rename is atomic.
        let compressed = compress::compress(data)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp.")
            .tempfile_in(dir)?;
        tmp.write_all(&compressed)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        debug!(chunk = %id, bytes = compressed.len(), "chunk written");
        Ok(())
    }

    /// Read and decompress a chunk. The plaintext is always re-hashed;
    /// a mismatch means the store can no longer be trusted and the caller
    /// must distrust every revision of the repository.
    pub fn get(&self, id: &ChunkId) -> Result<Vec<u8>> {
        let path = self.chunk_path(id);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackyError::ChunkMissing(*id));
            }
            Err(e) => return Err(e.into()),
        };
        let data = compress::decompress(&compressed).map_err(|e| {
            warn!(chunk = %id, error = %e, "chunk failed to decompress");
            BackyError::Integrity(*id)
        })?;
        if ChunkId::compute(&data) != *id {
            return Err(BackyError::Integrity(*id));
        }
        Ok(data)
    }

    /// Remove a single chunk file and drop it from the index. Used by
    /// verification when a chunk is known corrupt.
    pub fn unlink(&mut self, id: &ChunkId) -> Result<()> {
        let path = self.chunk_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.known.remove(id);
        Ok(())
    }

    /// Rebuild the id index from disk. Fixes up a dropped or partial
    /// index after a crash.
    pub fn scan(&mut self) -> Result<()> {
        let mut known = HashSet::new();
        for shard in 0u16..256 {
            let dir = self.path.join(format!("{shard:02x}"));
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(hex) = name.strip_suffix(CHUNK_SUFFIX) else {
                    continue;
                };
                match ChunkId::from_hex(hex) {
                    Ok(id) => {
                        known.insert(id);
                    }
                    Err(_) => warn!(file = name, "ignoring stray file in chunk store"),
                }
            }
        }
        self.known = known;
        Ok(())
    }

    /// Delete every chunk file whose id is not in `live`.
    ///
    /// Removals are issued in batches of at least [`UNLINK_BATCH`]; each
    /// batch ends with one fsync per touched shard directory to keep
    /// metadata traffic bounded.
    pub fn unlink_unreferenced(&mut self, live: &HashSet<ChunkId>) -> Result<usize> {
        let dead: Vec<ChunkId> = self.known.difference(live).copied().collect();
        if dead.is_empty() {
            return Ok(0);
        }
        info!(chunks = dead.len(), "purging unreferenced chunks");

        let mut removed = 0usize;
        for batch in dead.chunks(UNLINK_BATCH) {
            let mut touched_dirs: HashSet<PathBuf> = HashSet::new();
            for id in batch {
                let path = self.chunk_path(id);
                match fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        if let Some(dir) = path.parent() {
                            touched_dirs.insert(dir.to_path_buf());
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.known.remove(id);
            }
            for dir in touched_dirs {
                platform::fsync_dir(&dir)?;
            }
        }
        Ok(removed)
    }

    /// Reindex from disk, then remove everything not in `live`.
    pub fn purge(&mut self, live: &HashSet<ChunkId>) -> Result<usize> {
        self.scan()?;
        self.unlink_unreferenced(live)
    }
}
