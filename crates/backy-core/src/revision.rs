//! Revision metadata.
//!
//! One revision records one point-in-time image. The metadata lives in
//! `<repo>/<uuid>.rev` (YAML); the chunk map lives alongside in
//! `<repo>/<uuid>` in packed form (see [`crate::repo::format`]). Every
//! revision is self-contained: a block index absent from its map is a
//! hole, not an inherited region.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use backy_types::{uuid, Result};

/// Integrity marker. A completed revision only ever moves
/// `Trusted → Distrusted`, `Distrusted → Verified`, or is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trust {
    #[default]
    Trusted,
    Verified,
    Distrusted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevisionStats {
    pub bytes_read: u64,
    pub chunks_written: u64,
    pub chunks_reused: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub uuid: String,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock seconds of the producing backup; 0 until the backup
    /// completed successfully.
    #[serde(default)]
    pub duration: f64,
    /// Logical size of the imaged volume in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub trust: Trust,
    #[serde(default)]
    pub stats: RevisionStats,
}

impl Revision {
    /// Create a fresh in-progress revision with a new uuid.
    pub fn create(tags: BTreeSet<String>) -> Self {
        Revision {
            uuid: uuid::generate(),
            timestamp: Utc::now(),
            duration: 0.0,
            size: 0,
            tags,
            trust: Trust::Trusted,
            stats: RevisionStats::default(),
        }
    }

    /// A revision is complete once its duration has been stamped.
    pub fn is_complete(&self) -> bool {
        self.duration > 0.0
    }

    /// Path of the packed chunk map within `repo_path`.
    pub fn map_path(&self, repo_path: &Path) -> PathBuf {
        repo_path.join(&self.uuid)
    }

    /// Path of the metadata file within `repo_path`.
    pub fn info_path(&self, repo_path: &Path) -> PathBuf {
        repo_path.join(format!("{}.rev", self.uuid))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Persist the metadata atomically (temp file + rename).
    pub fn write_info(&self, repo_path: &Path) -> Result<()> {
        let target = self.info_path(repo_path);
        let mut tmp = tempfile::Builder::new()
            .prefix(".rev.")
            .tempfile_in(repo_path)?;
        serde_yaml::to_writer(&mut tmp, self)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove metadata and chunk map from disk.
    pub fn remove(&self, repo_path: &Path) -> Result<()> {
        info!(revision = %self.uuid, "removing revision");
        for path in [self.info_path(repo_path), self.map_path(repo_path)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn distrust(&mut self) {
        info!(revision = %self.uuid, "distrusting revision");
        self.trust = Trust::Distrusted;
    }

    pub fn verify(&mut self) {
        info!(revision = %self.uuid, "marking revision as verified");
        self.trust = Trust::Verified;
    }
}

/// Tags carrying the `manual:` prefix are exempt from schedule expiry
/// and schedule validation.
pub fn is_manual_tag(tag: &str) -> bool {
    tag.starts_with("manual:")
}

/// The subset of `tags` subject to schedule rules.
pub fn filter_schedule_tags<'a>(
    tags: impl IntoIterator<Item = &'a String>,
) -> BTreeSet<String> {
    tags.into_iter()
        .filter(|t| !is_manual_tag(t))
        .cloned()
        .collect()
}
