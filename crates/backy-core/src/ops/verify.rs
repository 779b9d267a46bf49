//! Full revision verification.
//!
//! Every mapped chunk is read through the store (which re-hashes) and,
//! where the adapter supports it, compared block by block against a
//! fresh read from the source. A clean pass promotes the revision to
//! VERIFIED; any failure forgets it. Corrupt chunk files are unlinked so
//! the next backup rewrites them.

use tracing::{error, info, warn};

use backy_types::{BackyError, Result};

use crate::repo::lock::RepoLock;
use crate::repo::Repository;
use crate::revision::Trust;
use crate::source::Source;
use crate::CHUNK_SIZE;

/// Verify the revision selected by `spec`, or every distrusted revision
/// when `spec` is `None`. Returns `true` when all checked revisions came
/// out clean.
pub fn verify(
    repo: &mut Repository,
    mut source: Option<&mut dyn Source>,
    spec: Option<&str>,
) -> Result<bool> {
    let _lock = RepoLock::exclusive(repo.path())?;
    repo.scan()?;

    let targets: Vec<String> = match spec {
        Some(spec) => repo.find_revisions(spec)?,
        None => repo
            .clean_history()
            .filter(|r| r.trust == Trust::Distrusted)
            .map(|r| r.uuid.clone())
            .collect(),
    };

    let mut all_clean = true;
    for uuid in targets {
        let clean = match source.as_mut() {
            Some(s) => verify_revision(repo, Some(&mut **s), &uuid)?,
            None => verify_revision(repo, None, &uuid)?,
        };
        all_clean &= clean;
    }
    repo.refresh_paranoia();
    Ok(all_clean)
}

/// Verify one revision. The caller holds the exclusive lock. Ends with a
/// purge so nothing untrusted lingers, especially when the revision was
/// forgotten.
pub(crate) fn verify_revision(
    repo: &mut Repository,
    mut source: Option<&mut dyn Source>,
    uuid: &str,
) -> Result<bool> {
    info!(revision = %uuid, "verifying revision");
    let map = repo.load_map(uuid)?;

    let mut clean = true;
    for (&index, id) in &map {
        let stored = match repo.store.get(id) {
            Ok(data) => data,
            Err(BackyError::Integrity(_)) | Err(BackyError::ChunkMissing(_)) => {
                error!(chunk = %id, block = index, "chunk failed verification");
                // Drop the bad file so a future backup writes it fresh.
                repo.store.unlink(id)?;
                clean = false;
                break;
            }
            Err(e) => return Err(e),
        };

        if let Some(src) = source.as_deref_mut() {
            if src.supports_verification() {
                let from_source = src.read_block(index)?;
                if from_source != stored {
                    error!(block = index, "stored chunk disagrees with source");
                    repo.quarantine.add(
                        index as u64 * CHUNK_SIZE as u64,
                        &from_source,
                        &stored,
                    )?;
                    clean = false;
                    break;
                }
            }
        }
    }

    let repo_path = repo.path().to_path_buf();
    if clean {
        info!(revision = %uuid, "no problems found, marking as verified");
        if let Some(rev) = repo.get_mut(uuid) {
            rev.verify();
            rev.write_info(&repo_path)?;
        }
    } else {
        warn!(revision = %uuid, "verification failed, removing revision");
        repo.forget(uuid)?;
    }

    repo.purge()?;
    Ok(clean)
}
