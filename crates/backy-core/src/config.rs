//! Per-repository configuration.
//!
//! Each repository directory carries a `config` file (YAML) naming its
//! schedule and source. The scheduler writes it when configuring a job so
//! repository operations can run standalone.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use backy_types::Result;

use crate::schedule::{Schedule, TagPolicyConfig};

pub const CONFIG_FILE: &str = "config";

/// Source specification, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceSpec {
    /// A plain file or block device.
    File {
        filename: String,
        /// Force every backup to examine all blocks.
        #[serde(default, rename = "full-always")]
        full_always: bool,
    },
    /// A Ceph RBD image addressed as pool/image.
    CephRbd {
        pool: String,
        image: String,
        #[serde(default, rename = "full-always")]
        full_always: bool,
    },
    /// A Ceph RBD image whose guest filesystem is quiesced through an
    /// external freeze command before the snapshot is taken.
    Flyingcircus {
        pool: String,
        image: String,
        vm: String,
        #[serde(default, rename = "full-always")]
        full_always: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    pub schedule: BTreeMap<String, TagPolicyConfig>,
    pub source: SourceSpec,
}

impl RepoConfig {
    pub fn load(repo_path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(repo_path.join(CONFIG_FILE))?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Write the config atomically. Returns early without touching disk
    /// when the content is unchanged.
    pub fn store(&self, repo_path: &Path) -> Result<()> {
        let target = repo_path.join(CONFIG_FILE);
        let rendered = serde_yaml::to_string(self)?;
        if let Ok(existing) = fs::read_to_string(&target) {
            if existing == rendered {
                return Ok(());
            }
        }
        let mut tmp = tempfile::Builder::new()
            .prefix(".config.")
            .tempfile_in(repo_path)?;
        tmp.write_all(rendered.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::configure(&self.schedule)
    }
}
