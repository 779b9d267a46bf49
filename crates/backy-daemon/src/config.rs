//! Scheduler configuration.
//!
//! ```yaml
//! global:
//!   base-dir: /srv/backy
//!   worker-limit: 3
//!   backup-completed-callback: /usr/local/bin/notify
//! schedules:
//!   default:
//!     daily: {interval: 1d, keep: 9}
//!     weekly: {interval: 7d, keep: 5}
//! jobs:
//!   vm01:
//!     schedule: default
//!     source: {type: file, filename: /srv/images/vm01}
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use backy_core::config::SourceSpec;
use backy_core::schedule::{Schedule, TagPolicyConfig};
use backy_types::{BackyError, Result};

fn default_worker_limit() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GlobalConfig {
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,
    #[serde(rename = "worker-limit", default = "default_worker_limit")]
    pub worker_limit: usize,
    #[serde(rename = "backup-completed-callback", default)]
    pub backup_completed_callback: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JobConfig {
    pub schedule: String,
    pub source: SourceSpec,
}

pub type ScheduleSpec = BTreeMap<String, TagPolicyConfig>;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DaemonConfig {
    pub global: GlobalConfig,
    #[serde(default)]
    pub schedules: BTreeMap<String, ScheduleSpec>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| BackyError::Config(format!("{}: {e}", path.display())))?;
        let config: DaemonConfig = serde_yaml::from_str(&raw)
            .map_err(|e| BackyError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references and interval grammar before any job is
    /// touched.
    pub fn validate(&self) -> Result<()> {
        if self.global.worker_limit == 0 {
            return Err(BackyError::Config("worker-limit must be positive".into()));
        }
        for (name, spec) in &self.schedules {
            Schedule::configure(spec)
                .map_err(|e| BackyError::Config(format!("schedule '{name}': {e}")))?;
        }
        for (name, job) in &self.jobs {
            if !self.schedules.contains_key(&job.schedule) {
                return Err(BackyError::Config(format!(
                    "job '{name}' references unknown schedule '{}'",
                    job.schedule
                )));
            }
        }
        Ok(())
    }

    /// The parsed schedule for a job. Callers have validated already.
    pub fn schedule_for(&self, job: &JobConfig) -> Result<Schedule> {
        Schedule::configure(&self.schedules[&job.schedule])
    }

    pub fn schedule_spec_for(&self, job: &JobConfig) -> &ScheduleSpec {
        &self.schedules[&job.schedule]
    }
}
