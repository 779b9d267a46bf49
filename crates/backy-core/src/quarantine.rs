//! Quarantine of verification mismatches.
//!
//! When a freshly read sample from the source disagrees with the stored
//! chunk, both sides are preserved here for forensics together with a
//! small YAML report. Nothing in the read path ever consults this
//! directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use backy_types::{uuid, ChunkId, Result};

const QUARANTINE_DIR: &str = "quarantine";
const CHUNKS_DIR: &str = "chunks";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineReport {
    pub uuid: String,
    /// Byte offset of the mismatching block within the volume.
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    /// Content hash of the block as re-read from the source.
    pub source_hash: String,
    /// Content hash of the block as stored in the chunk store.
    pub stored_hash: String,
}

pub struct QuarantineStore {
    path: PathBuf,
    chunks_path: PathBuf,
    report_ids: Vec<String>,
}

impl QuarantineStore {
    pub fn open(repo_path: &Path) -> Result<Self> {
        let path = repo_path.join(QUARANTINE_DIR);
        let chunks_path = path.join(CHUNKS_DIR);
        fs::create_dir_all(&chunks_path)?;

        let mut report_ids = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".report")) {
                report_ids.push(id.to_string());
            }
        }
        debug!(reports = report_ids.len(), "quarantine scanned");
        Ok(QuarantineStore {
            path,
            chunks_path,
            report_ids,
        })
    }

    pub fn report_count(&self) -> usize {
        self.report_ids.len()
    }

    /// Preserve a source/store mismatch at byte `offset`.
    pub fn add(&mut self, offset: u64, source_block: &[u8], stored_block: &[u8]) -> Result<()> {
        let source_hash = ChunkId::compute(source_block).to_hex();
        let stored_hash = ChunkId::compute(stored_block).to_hex();
        let report = QuarantineReport {
            uuid: uuid::generate(),
            offset,
            timestamp: Utc::now(),
            source_hash: source_hash.clone(),
            stored_hash: stored_hash.clone(),
        };
        info!(report = %report.uuid, offset, "quarantining verification mismatch");

        self.store_chunk(&source_hash, source_block)?;
        self.store_chunk(&stored_hash, stored_block)?;

        let target = self.path.join(format!("{}.report", report.uuid));
        let mut tmp = tempfile::Builder::new()
            .prefix(".report.")
            .tempfile_in(&self.path)?;
        serde_yaml::to_writer(&mut tmp, &report)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;

        self.report_ids.push(report.uuid);
        Ok(())
    }

    fn store_chunk(&self, hash: &str, data: &[u8]) -> Result<()> {
        let path = self.chunks_path.join(hash);
        if path.exists() {
            debug!(hash, "quarantine chunk already preserved");
            return Ok(());
        }
        fs::write(&path, data)?;
        Ok(())
    }
}
