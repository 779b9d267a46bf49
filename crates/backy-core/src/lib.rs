pub mod compress;
pub mod config;
pub mod ops;
pub mod platform;
pub mod quarantine;
pub mod repo;
pub mod revision;
pub mod schedule;
pub mod source;
pub mod store;

pub use backy_types::{BackyError, ChunkId, Result};

/// Fixed chunk size: 4 MiB. A volume is a sparse sequence of blocks of
/// this size; the last block of a source may be shorter.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[cfg(test)]
mod tests;
#[cfg(test)]
pub mod testutil;
