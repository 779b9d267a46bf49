use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::{BackyError, Result};

/// A 16-byte chunk identifier: MurmurHash3 x64-128 of the plaintext.
///
/// The fingerprint is non-cryptographic; collisions within one repository
/// are assumed absent in exchange for hashing throughput.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub [u8; 16]);

impl ChunkId {
    /// Compute the id of a plaintext buffer.
    pub fn compute(data: &[u8]) -> Self {
        let digest = murmur3::murmur3_x64_128(&mut Cursor::new(data), 0)
            .expect("murmur3 over an in-memory cursor cannot fail");
        ChunkId(digest.to_le_bytes())
    }

    /// Hex-encode the full id (32 lowercase chars) for use in file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32-char hex id, e.g. from a chunk file name.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| BackyError::InvalidFormat(format!("bad chunk id '{s}'")))?;
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| BackyError::InvalidFormat(format!("bad chunk id length in '{s}'")))?;
        Ok(ChunkId(raw))
    }

    /// First byte as a two-char hex string, used for the shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_deterministic() {
        let data = b"hello world";
        assert_eq!(ChunkId::compute(data), ChunkId::compute(data));
    }

    #[test]
    fn compute_different_data_different_id() {
        assert_ne!(ChunkId::compute(b"hello"), ChunkId::compute(b"world"));
    }

    #[test]
    fn hex_roundtrip() {
        let id = ChunkId::compute(b"roundtrip");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(ChunkId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(ChunkId::from_hex("not hex at all").is_err());
        assert!(ChunkId::from_hex("abcd").is_err());
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let id = ChunkId([0xAB; 16]);
        assert_eq!(id.shard_prefix(), "ab");
    }

    #[test]
    fn empty_data_produces_valid_id() {
        let id = ChunkId::compute(b"");
        assert_eq!(id.to_hex().len(), 32);
    }
}
