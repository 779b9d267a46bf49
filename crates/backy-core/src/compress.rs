//! LZO codec for chunk files.
//!
//! Chunk plaintext is at most [`CHUNK_SIZE`] bytes; decompression is
//! bounded by that to guard against crafted chunk files.

use std::cell::RefCell;

use backy_types::{BackyError, Result};

use crate::CHUNK_SIZE;

thread_local! {
    static LZO: RefCell<Option<minilzo_rs::LZO>> = const { RefCell::new(None) };
}

fn with_codec<T>(f: impl FnOnce(&mut minilzo_rs::LZO) -> Result<T>) -> Result<T> {
    LZO.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let codec = minilzo_rs::LZO::init()
                .map_err(|e| BackyError::Compression(format!("lzo init: {e:?}")))?;
            *slot = Some(codec);
        }
        f(slot.as_mut().unwrap())
    })
}

/// Compress chunk plaintext for storage.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    with_codec(|codec| {
        codec
            .compress(data)
            .map_err(|e| BackyError::Compression(format!("lzo compress: {e:?}")))
    })
}

/// Decompress a chunk file payload. Output is bounded by the chunk size.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    with_codec(|codec| {
        codec
            .decompress_safe(data, CHUNK_SIZE)
            .map_err(|e| BackyError::Compression(format!("lzo decompress: {e:?}")))
    })
}
