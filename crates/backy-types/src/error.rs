use thiserror::Error;

use crate::chunk_id::ChunkId;

pub type Result<T> = std::result::Result<T, BackyError>;

#[derive(Debug, Error)]
pub enum BackyError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("source reported unreadable data at offset {offset}: {detail}")]
    SourceCorrupt { offset: u64, detail: String },

    #[error("chunk {0} failed content verification")]
    Integrity(ChunkId),

    #[error("repository is locked by another process (lock: {0})")]
    LockHeld(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid on-disk format: {0}")]
    InvalidFormat(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("revision not found: '{0}'")]
    RevisionNotFound(String),

    #[error("chunk missing from store: {0}")]
    ChunkMissing(ChunkId),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BackyError {
    /// Whether this error signals exhausted storage. Jobs treat these like
    /// any other failure (roll back, back off) but callers may want to log
    /// them more loudly.
    pub fn is_disk_full(&self) -> bool {
        match self {
            BackyError::Io(e) => matches!(e.raw_os_error(), Some(code) if code == 28),
            _ => false,
        }
    }

    /// Transient errors let the scheduler back off without alarm.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackyError::SourceUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_detected_by_errno() {
        let e = BackyError::Io(std::io::Error::from_raw_os_error(28));
        assert!(e.is_disk_full());
        let e = BackyError::Io(std::io::Error::from_raw_os_error(2));
        assert!(!e.is_disk_full());
    }

    #[test]
    fn source_unavailable_is_transient() {
        assert!(BackyError::SourceUnavailable("vm down".into()).is_transient());
        assert!(!BackyError::Config("bad".into()).is_transient());
    }
}
