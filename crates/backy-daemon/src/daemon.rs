//! The scheduling daemon.
//!
//! Owns one job per configured repository, the dual worker pools, and the
//! reload/terminate/status hooks. The hooks are plain methods so any
//! admin transport can drive them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use backy_types::{BackyError, Result};

use crate::config::{DaemonConfig, JobConfig};
use crate::job::{Job, JobStatus, WorkerPools};

/// How long running backups get to finish after a terminate request
/// before they are hard-cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15 * 60);
/// Extra time for the hard cancel to take effect before tasks are
/// aborted outright.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

struct JobEntry {
    job: Arc<Job>,
    task: JoinHandle<()>,
    config: JobConfig,
}

struct DaemonState {
    config: DaemonConfig,
    pools: WorkerPools,
    jobs: BTreeMap<String, JobEntry>,
}

pub struct Daemon {
    config_path: PathBuf,
    state: Mutex<DaemonState>,
}

impl Daemon {
    /// Load the config and start all jobs. An invalid config at startup
    /// is fatal; later reloads keep the previous one.
    pub fn start(config_path: PathBuf) -> Result<Arc<Self>> {
        let config = DaemonConfig::load(&config_path)?;
        std::fs::create_dir_all(&config.global.base_dir)?;
        let pools = WorkerPools::new(config.global.worker_limit);
        info!(
            base_dir = %config.global.base_dir.display(),
            worker_limit = config.global.worker_limit,
            jobs = config.jobs.len(),
            "daemon starting"
        );

        let daemon = Arc::new(Daemon {
            config_path,
            state: Mutex::new(DaemonState {
                config: config.clone(),
                pools,
                jobs: BTreeMap::new(),
            }),
        });
        daemon.apply_config(config)?;
        Ok(daemon)
    }

    /// Diff the job table against `config`: new jobs start, changed jobs
    /// restart, vanished jobs go dead (finishing a running backup first),
    /// unchanged jobs keep their state.
    fn apply_config(&self, config: DaemonConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pools = WorkerPools::new(config.global.worker_limit);

        // Stop vanished jobs.
        let gone: Vec<String> = state
            .jobs
            .keys()
            .filter(|name| !config.jobs.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            info!(job = %name, "job removed from config");
            let entry = state.jobs.remove(&name).unwrap();
            entry.job.stop();
        }

        // Start new jobs and restart changed ones.
        for (name, job_config) in &config.jobs {
            let unchanged = state
                .jobs
                .get(name)
                .map(|e| e.config == *job_config)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            if let Some(entry) = state.jobs.remove(name) {
                info!(job = %name, "job configuration changed, restarting");
                entry.job.stop();
            } else {
                info!(job = %name, "job added");
            }
            let job = Job::configure(
                name,
                &config.global.base_dir,
                config.schedule_spec_for(job_config),
                &job_config.source,
                config.global.backup_completed_callback.clone(),
                state.pools.clone(),
            )?;
            let task = tokio::spawn(Arc::clone(&job).run_forever());
            state.jobs.insert(
                name.clone(),
                JobEntry {
                    job,
                    task,
                    config: job_config.clone(),
                },
            );
        }

        state.config = config;
        Ok(())
    }

    /// Re-read the configuration. On a parse or validation error the
    /// running config is kept.
    pub fn reload(&self) {
        info!("reloading configuration");
        match DaemonConfig::load(&self.config_path) {
            Ok(config) => match self.apply_config(config) {
                Ok(()) => info!("reload finished"),
                Err(e) => error!(error = %e, "reload failed, keeping previous jobs"),
            },
            Err(e) => error!(error = %e, "invalid configuration, keeping previous one"),
        }
    }

    /// Trigger an ad-hoc run of one job.
    pub fn run_job(&self, name: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        let entry = state
            .jobs
            .get(name)
            .ok_or_else(|| BackyError::Config(format!("unknown job '{name}'")))?;
        entry.job.trigger();
        Ok(())
    }

    /// Names of all configured jobs.
    pub fn jobs(&self) -> Vec<String> {
        self.state.lock().unwrap().jobs.keys().cloned().collect()
    }

    /// Status of every job, for the admin surface and check commands.
    pub fn status(&self) -> Vec<JobStatus> {
        let jobs: Vec<Arc<Job>> = {
            let state = self.state.lock().unwrap();
            state.jobs.values().map(|e| Arc::clone(&e.job)).collect()
        };
        jobs.iter().map(|job| job.status()).collect()
    }

    /// Run until terminated. SIGTERM/SIGINT drain and exit; SIGHUP
    /// reloads the configuration.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sighup = signal(SignalKind::hangup())?;
            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received");
                        break;
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received");
                        break;
                    }
                    _ = sighup.recv() => self.reload(),
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting runs, cancel all waits, let running backups finish
    /// within the grace period, then hard-cancel the stragglers.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let entries: Vec<(Arc<Job>, JoinHandle<()>)> = {
            let mut state = self.state.lock().unwrap();
            let jobs = std::mem::take(&mut state.jobs);
            jobs.into_values().map(|e| (e.job, e.task)).collect()
        };
        for (job, _) in &entries {
            job.stop();
        }

        for (job, mut task) in entries {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_ok() {
                continue;
            }
            warn!(job = %job.name, "backup still running, cancelling");
            job.cancel_running();
            if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
                warn!(job = %job.name, "job did not stop, aborting task");
                task.abort();
            }
        }
        info!("shutdown complete");
    }
}
