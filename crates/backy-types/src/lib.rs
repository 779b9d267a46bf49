pub mod chunk_id;
pub mod error;
pub mod uuid;

pub use chunk_id::ChunkId;
pub use error::{BackyError, Result};
