//! The restore operation.
//!
//! Writes a revision back out to a file, block device, or stdout. The
//! destination is never read: mapped blocks are written at their offset,
//! holes are punched (or zero-filled where punching is unsupported).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use backy_types::{BackyError, Result};

use crate::platform;
use crate::repo::lock::RepoLock;
use crate::repo::Repository;
use crate::CHUNK_SIZE;

#[derive(Debug, Clone)]
pub enum RestoreTarget {
    /// A regular file or block device path.
    Path(PathBuf),
    /// Stream to stdout, for pipe processing.
    Stdout,
}

/// Restore the revision selected by `spec` into `target`.
pub fn restore(repo: &mut Repository, spec: &str, target: &RestoreTarget) -> Result<()> {
    let _lock = RepoLock::shared(repo.path())?;
    repo.scan()?;
    let revision = repo.find(spec)?.clone();
    let map = repo.load_map(&revision.uuid)?;
    info!(
        revision = %revision.uuid,
        size = revision.size,
        chunks = map.len(),
        "restore started"
    );

    match target {
        RestoreTarget::Path(path) => restore_path(repo, &revision.uuid, revision.size, &map, path),
        RestoreTarget::Stdout => {
            let stdout = std::io::stdout();
            restore_stream(repo, revision.size, &map, &mut stdout.lock())
        }
    }
}

fn restore_path(
    repo: &mut Repository,
    uuid: &str,
    size: u64,
    map: &crate::repo::format::ChunkMap,
    path: &std::path::Path,
) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let is_regular = file.metadata()?.is_file();
    if is_regular {
        file.set_len(size)?;
        // Allocation support is optional.
        let _ = platform::preallocate(&file, size);
    }

    // Holes are punched even on a freshly sized file: the target may have
    // existed with old content in those ranges.
    let mut cursor = 0u64;
    for (&index, id) in map {
        let offset = index as u64 * CHUNK_SIZE as u64;
        if offset > cursor {
            platform::punch_hole(&mut file, cursor, offset - cursor)?;
        }
        let data = get_chunk(repo, id)?;
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)?;
        cursor = offset + data.len() as u64;
    }
    if size > cursor {
        platform::punch_hole(&mut file, cursor, size - cursor)?;
    }

    file.sync_all()?;
    info!(revision = %uuid, target = %path.display(), "restore finished");
    Ok(())
}

fn restore_stream(
    repo: &mut Repository,
    size: u64,
    map: &crate::repo::format::ChunkMap,
    out: &mut impl Write,
) -> Result<()> {
    let zeroes = vec![0u8; CHUNK_SIZE];
    let mut cursor = 0u64;
    for (&index, id) in map {
        let offset = index as u64 * CHUNK_SIZE as u64;
        while cursor < offset {
            let n = zeroes.len().min((offset - cursor) as usize);
            out.write_all(&zeroes[..n])?;
            cursor += n as u64;
        }
        let data = get_chunk(repo, id)?;
        out.write_all(&data)?;
        cursor += data.len() as u64;
    }
    while cursor < size {
        let n = zeroes.len().min((size - cursor) as usize);
        out.write_all(&zeroes[..n])?;
        cursor += n as u64;
    }
    out.flush()?;
    Ok(())
}

/// Read a chunk, promoting an integrity failure to repository-wide
/// distrust before propagating it.
fn get_chunk(repo: &mut Repository, id: &backy_types::ChunkId) -> Result<Vec<u8>> {
    match repo.store.get(id) {
        Ok(data) => Ok(data),
        Err(BackyError::Integrity(id)) => {
            repo.distrust_all()?;
            Err(BackyError::Integrity(id))
        }
        Err(e) => Err(e),
    }
}
