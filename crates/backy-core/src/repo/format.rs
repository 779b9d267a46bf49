//! Packed chunk map codec.
//!
//! A revision's chunk map is a little-endian sequence of fixed 20-byte
//! records, sorted by block index ascending:
//!
//! ```text
//! u32 offset_index || 16-byte chunk id
//! ```
//!
//! Holes are omitted entirely; a block index missing from the file reads
//! as zeroes up to the revision's size.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use backy_types::{BackyError, ChunkId, Result};

/// Sparse block-index → chunk-id mapping of one revision.
pub type ChunkMap = BTreeMap<u32, ChunkId>;

const RECORD_LEN: usize = 4 + 16;

/// Serialize a chunk map into its packed byte form.
pub fn encode_map(map: &ChunkMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(map.len() * RECORD_LEN);
    for (index, id) in map {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&id.0);
    }
    out
}

/// Parse a packed chunk map, validating record framing and ordering.
pub fn decode_map(data: &[u8]) -> Result<ChunkMap> {
    if data.len() % RECORD_LEN != 0 {
        return Err(BackyError::InvalidFormat(format!(
            "chunk map length {} is not a multiple of {RECORD_LEN}",
            data.len()
        )));
    }
    let mut map = ChunkMap::new();
    let mut last: Option<u32> = None;
    for record in data.chunks_exact(RECORD_LEN) {
        let index = u32::from_le_bytes(record[..4].try_into().unwrap());
        if let Some(prev) = last {
            if index <= prev {
                return Err(BackyError::InvalidFormat(format!(
                    "chunk map records out of order at block {index}"
                )));
            }
        }
        last = Some(index);
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&record[4..]);
        map.insert(index, ChunkId(raw));
    }
    Ok(map)
}

/// Atomically write the packed map for a revision.
pub fn write_map(repo_path: &Path, uuid: &str, map: &ChunkMap) -> Result<()> {
    let target = repo_path.join(uuid);
    let mut tmp = tempfile::Builder::new()
        .prefix(".map.")
        .tempfile_in(repo_path)?;
    tmp.write_all(&encode_map(map))?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}

/// Read the packed map of a revision.
pub fn read_map(repo_path: &Path, uuid: &str) -> Result<ChunkMap> {
    let data = fs::read(repo_path.join(uuid))?;
    decode_map(&data)
}
