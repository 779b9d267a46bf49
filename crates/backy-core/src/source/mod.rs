//! Source adapters.
//!
//! A source enumerates the data of one volume and drives backup and
//! verification. The contract is a small capability set behind a trait
//! object; adapters may use source-specific change tracking as long as
//! `blocks_to_examine` returns a superset of the actually-changed blocks.

pub mod ceph;
pub mod file;
pub mod flyingcircus;

use backy_types::Result;

use crate::config::SourceSpec;
use crate::revision::Revision;

/// Which blocks a backup has to read from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSelection {
    /// Examine every block up to the source size.
    All,
    /// Examine exactly these block indices (order is irrelevant, the
    /// backup sorts). Must be a superset of the changed blocks.
    Blocks(Vec<u32>),
}

pub trait Source {
    /// Logical size of the volume in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Fast availability probe. A transient failure here lets the
    /// scheduler back off without raising a full error.
    fn ready(&mut self) -> Result<()>;

    /// Block indices to examine for this backup. `parent` is the previous
    /// completed revision, if any.
    fn blocks_to_examine(&mut self, parent: Option<&Revision>) -> Result<BlockSelection>;

    /// Read up to `CHUNK_SIZE` bytes at `index * CHUNK_SIZE`; shorter only
    /// at end of volume.
    fn read_block(&mut self, index: u32) -> Result<Vec<u8>>;

    /// Acquire a consistent view of the source for the revision being
    /// backed up. Paired with [`Source::snapshot_end`] on every exit path.
    fn snapshot_begin(&mut self, revision_uuid: &str) -> Result<()> {
        let _ = revision_uuid;
        Ok(())
    }

    /// Release the consistent view. `commit` is true when the backup
    /// completed successfully.
    fn snapshot_end(&mut self, commit: bool) -> Result<()> {
        let _ = commit;
        Ok(())
    }

    /// Whether verification may re-read blocks from this source after the
    /// backup finished.
    fn supports_verification(&self) -> bool {
        true
    }
}

/// Build the adapter for a source specification.
pub fn open_source(spec: &SourceSpec) -> Result<Box<dyn Source>> {
    match spec {
        SourceSpec::File {
            filename,
            full_always,
        } => Ok(Box::new(file::FileSource::new(filename, *full_always))),
        SourceSpec::CephRbd {
            pool,
            image,
            full_always,
        } => Ok(Box::new(ceph::CephSource::new(pool, image, *full_always))),
        SourceSpec::Flyingcircus {
            pool,
            image,
            vm,
            full_always,
        } => Ok(Box::new(flyingcircus::FlyingCircusSource::new(
            pool,
            image,
            vm,
            *full_always,
        ))),
    }
}
