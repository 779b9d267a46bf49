use std::collections::BTreeMap;

use tempfile::TempDir;

use backy_types::Result;

use crate::repo::Repository;
use crate::revision::Revision;
use crate::schedule::{Schedule, TagPolicyConfig};
use crate::source::{BlockSelection, Source};
use crate::CHUNK_SIZE;

/// Create an empty repository in a fresh temp directory.
pub fn test_repo() -> (TempDir, Repository) {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = Repository::open(dir.path()).expect("failed to open test repo");
    (dir, repo)
}

/// Deterministic pseudo-random image data.
pub fn image_data(len: usize, seed: u8) -> Vec<u8> {
    let mut state = seed as u32 | 1;
    (0..len)
        .map(|_| {
            // xorshift, good enough for non-compressible test data
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xFF) as u8
        })
        .collect()
}

/// A schedule of `daily keep=3, weekly keep=2` style entries.
pub fn schedule_of(entries: &[(&str, &str, usize)]) -> Schedule {
    let config: BTreeMap<String, TagPolicyConfig> = entries
        .iter()
        .map(|(tag, interval, keep)| {
            (
                tag.to_string(),
                TagPolicyConfig {
                    interval: interval.to_string(),
                    keep: *keep,
                },
            )
        })
        .collect();
    Schedule::configure(&config).expect("test schedule")
}

/// In-memory source for unit tests. Counts calls so tests can observe
/// whether change tracking was consulted.
pub struct MemorySource {
    pub data: Vec<u8>,
    /// `None` reports all blocks; `Some` reports exactly these.
    pub examine: Option<Vec<u32>>,
    pub ready_error: Option<String>,
    pub examine_calls: usize,
    pub blocks_read: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        MemorySource {
            data,
            examine: None,
            ready_error: None,
            examine_calls: 0,
            blocks_read: 0,
        }
    }
}

impl Source for MemorySource {
    fn size(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn ready(&mut self) -> Result<()> {
        match &self.ready_error {
            Some(msg) => Err(backy_types::BackyError::SourceUnavailable(msg.clone())),
            None => Ok(()),
        }
    }

    fn blocks_to_examine(&mut self, _parent: Option<&Revision>) -> Result<BlockSelection> {
        self.examine_calls += 1;
        Ok(match &self.examine {
            Some(blocks) => BlockSelection::Blocks(blocks.clone()),
            None => BlockSelection::All,
        })
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>> {
        self.blocks_read += 1;
        let start = index as usize * CHUNK_SIZE;
        if start >= self.data.len() {
            return Ok(Vec::new());
        }
        let end = (start + CHUNK_SIZE).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }
}
