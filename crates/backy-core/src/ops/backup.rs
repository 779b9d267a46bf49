//! The backup operation.
//!
//! Reverse-incremental and content-addressed: the source names the blocks
//! worth examining (any superset of the actually-changed ones), zeroed
//! regions become holes, everything else goes through the deduplicating
//! chunk store, and unexamined blocks inherit their chunk id from the
//! parent revision's self-contained map.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{info, warn};

use backy_types::{BackyError, Result};

use crate::repo::format::{self, ChunkMap};
use crate::repo::lock::RepoLock;
use crate::repo::Repository;
use crate::revision::{Revision, Trust};
use crate::source::{BlockSelection, Source};
use crate::store::PutResult;
use crate::CHUNK_SIZE;

/// Post-backup verification samples at most this many blocks.
const VERIFY_SAMPLE_MAX: usize = 1000;
/// Verification stops after this wall-clock budget.
const VERIFY_BUDGET: Duration = Duration::from_secs(5 * 60);

fn is_all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<()> {
    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
        Err(BackyError::Other("backup cancelled".into()))
    } else {
        Ok(())
    }
}

/// Run one backup. Returns the uuid of the new revision.
///
/// On failure or cancellation the partial revision is removed and the
/// source snapshot released; chunks already written stay behind for the
/// next purge.
pub fn backup(
    repo: &mut Repository,
    source: &mut dyn Source,
    tags: BTreeSet<String>,
    cancel: Option<&AtomicBool>,
) -> Result<String> {
    let _lock = RepoLock::exclusive(repo.path())?;
    repo.scan()?;
    repo.clean_incomplete()?;
    repo.refresh_paranoia();
    repo.store.begin_run();

    source
        .ready()
        .map_err(|e| BackyError::SourceUnavailable(e.to_string()))?;

    let start = Instant::now();
    let parent = repo.latest_completed().cloned();
    let mut revision = Revision::create(tags);
    revision.write_info(repo.path())?;
    info!(
        revision = %revision.uuid,
        tags = %revision.tags.iter().cloned().collect::<Vec<_>>().join(","),
        "created revision"
    );

    source.snapshot_begin(&revision.uuid)?;
    let result = run_backup(repo, source, &mut revision, parent.as_ref(), start, cancel);
    let commit = result.is_ok();
    if let Err(e) = source.snapshot_end(commit) {
        warn!(error = %e, "snapshot release failed");
    }

    match result {
        Ok(()) => {
            let uuid = revision.uuid.clone();
            repo.add(revision);
            repo.refresh_paranoia();

            // Keep the quarantine draining: after a good backup, verify
            // one still-distrusted older revision if any remain. Their
            // snapshots are long gone, so this is a chunk-hash pass only.
            let distrusted = repo
                .clean_history()
                .find(|r| r.trust == Trust::Distrusted && r.uuid != uuid)
                .map(|r| r.uuid.clone());
            if let Some(distrusted) = distrusted {
                warn!(revision = %distrusted, "distrusted revisions remain, verifying");
                super::verify::verify_revision(repo, None, &distrusted)?;
                repo.refresh_paranoia();
            }
            Ok(uuid)
        }
        Err(e) => {
            warn!(revision = %revision.uuid, error = %e, "backup failed, rolling back");
            if let Err(cleanup) = revision.remove(repo.path()) {
                warn!(revision = %revision.uuid, error = %cleanup, "rollback cleanup failed");
            }
            Err(e)
        }
    }
}

fn run_backup(
    repo: &mut Repository,
    source: &mut dyn Source,
    revision: &mut Revision,
    parent: Option<&Revision>,
    start: Instant,
    cancel: Option<&AtomicBool>,
) -> Result<()> {
    let size = source.size()?;
    revision.size = size;
    let total_blocks = size.div_ceil(CHUNK_SIZE as u64) as u32;

    // A distrusted parent escalates this run to a full backup: nothing
    // inherited, every block examined.
    let full = match parent {
        Some(p) => p.trust == Trust::Distrusted,
        None => true,
    };
    let selection = if full {
        BlockSelection::All
    } else {
        source.blocks_to_examine(parent)?
    };
    let mut examine: Vec<u32> = match selection {
        BlockSelection::All => (0..total_blocks).collect(),
        BlockSelection::Blocks(blocks) => {
            blocks.into_iter().filter(|&b| b < total_blocks).collect()
        }
    };
    examine.sort_unstable();
    examine.dedup();
    info!(
        blocks = examine.len(),
        total_blocks,
        full,
        "examining source blocks"
    );

    let mut map = ChunkMap::new();
    let examined: BTreeSet<u32> = examine.iter().copied().collect();
    for &index in &examine {
        check_cancel(cancel)?;
        let data = source.read_block(index)?;
        revision.stats.bytes_read += data.len() as u64;
        if data.is_empty() || is_all_zero(&data) {
            continue;
        }
        let (id, outcome) = repo.store.put(&data)?;
        match outcome {
            PutResult::Written => revision.stats.chunks_written += 1,
            PutResult::Reused => revision.stats.chunks_reused += 1,
        }
        map.insert(index, id);
    }

    // Unexamined blocks carry over from the parent. The map stays
    // self-contained: the ids are copied, not referenced.
    if let Some(parent) = parent {
        if !full {
            let parent_map = repo.load_map(&parent.uuid)?;
            for (index, id) in parent_map {
                if index < total_blocks && !examined.contains(&index) {
                    revision.stats.chunks_reused += 1;
                    map.insert(index, id);
                }
            }
        }
    }

    format::write_map(repo.path(), &revision.uuid, &map)?;
    revision.duration = start.elapsed().as_secs_f64();
    revision.write_info(repo.path())?;
    info!(
        revision = %revision.uuid,
        duration = revision.duration,
        written = revision.stats.chunks_written,
        reused = revision.stats.chunks_reused,
        "backup finished"
    );

    if source.supports_verification() {
        sample_verify(repo, source, revision, &map, total_blocks, cancel)?;
    }
    Ok(())
}

/// Compare a random sample of blocks against a fresh read from the
/// source. Mismatches are quarantined and demote the revision to
/// distrusted, but never fail the backup. Bounded by [`VERIFY_BUDGET`].
fn sample_verify(
    repo: &mut Repository,
    source: &mut dyn Source,
    revision: &mut Revision,
    map: &ChunkMap,
    total_blocks: u32,
    cancel: Option<&AtomicBool>,
) -> Result<()> {
    if total_blocks == 0 {
        return Ok(());
    }
    let mut blocks: Vec<u32> = (0..total_blocks).collect();
    blocks.shuffle(&mut rand::thread_rng());
    blocks.truncate(VERIFY_SAMPLE_MAX.min(total_blocks as usize));

    let started = Instant::now();
    let mut mismatches = 0usize;
    for index in blocks {
        check_cancel(cancel)?;
        if started.elapsed() > VERIFY_BUDGET {
            info!("verification budget exhausted, stopping sample");
            break;
        }
        let from_source = source.read_block(index)?;
        let stored = match map.get(&index) {
            Some(id) => match repo.store.get(id) {
                Ok(data) => data,
                Err(BackyError::Integrity(id)) => {
                    repo.distrust_all()?;
                    return Err(BackyError::Integrity(id));
                }
                Err(e) => return Err(e),
            },
            None => vec![0u8; from_source.len()],
        };
        if from_source != stored {
            warn!(
                block = index,
                offset = index as u64 * CHUNK_SIZE as u64,
                "verification sample mismatch"
            );
            repo.quarantine
                .add(index as u64 * CHUNK_SIZE as u64, &from_source, &stored)?;
            mismatches += 1;
        }
    }

    if mismatches > 0 {
        revision.distrust();
        revision.write_info(repo.path())?;
        repo.refresh_paranoia();
    }
    Ok(())
}
