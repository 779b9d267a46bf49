//! Plain file (or block device) source.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use backy_types::{BackyError, Result};

use crate::revision::Revision;
use crate::CHUNK_SIZE;

use super::{BlockSelection, Source};

/// Reads a raw image from a regular file. Has no change tracking, so
/// every backup examines all blocks; dedup in the chunk store keeps
/// unchanged blocks cheap anyway.
pub struct FileSource {
    path: PathBuf,
    full_always: bool,
    file: Option<File>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, full_always: bool) -> Self {
        FileSource {
            path: path.into(),
            full_always,
            file: None,
        }
    }

    fn open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|e| {
                BackyError::SourceUnavailable(format!("{}: {e}", self.path.display()))
            })?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }
}

impl Source for FileSource {
    fn size(&mut self) -> Result<u64> {
        let file = self.open()?;
        Ok(file.metadata()?.len())
    }

    fn ready(&mut self) -> Result<()> {
        self.open().map(|_| ())
    }

    fn blocks_to_examine(&mut self, _parent: Option<&Revision>) -> Result<BlockSelection> {
        // No change tracking available; `full_always` is implied.
        let _ = self.full_always;
        Ok(BlockSelection::All)
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>> {
        let size = self.size()?;
        let offset = index as u64 * CHUNK_SIZE as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let want = CHUNK_SIZE.min((size - offset) as usize);
        let file = self.open()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)
            .map_err(|e| BackyError::SourceCorrupt {
                offset,
                detail: e.to_string(),
            })?;
        Ok(buf)
    }
}
