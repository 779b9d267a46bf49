//! Per-repository job: a state machine driven by one async task.
//!
//! A job cycles through waiting-for-deadline, waiting-for-slot and
//! running. A successful run finishes and goes back to waiting for the
//! next deadline; a failed run re-enters the deadline wait with
//! exponential backoff. Stopped jobs are dead.
//!
//! The task suspends at deadline sleeps, worker-pool acquisition, and the
//! blocking backup itself. Stopping a job cancels the waits but lets a
//! running backup finish; hard cancellation goes through the shared
//! cancel flag the backup observes at every block.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, Semaphore};
use tracing::{info, warn};

use backy_core::config::{RepoConfig, SourceSpec};
use backy_core::ops;
use backy_core::repo::Repository;
use backy_core::revision::is_manual_tag;
use backy_core::schedule::Schedule;
use backy_core::source::open_source;
use backy_types::{BackyError, Result};

use crate::config::ScheduleSpec;

/// A job whose previous completed run took at least this long enters the
/// slow pool for its next run.
pub const SLOW_THRESHOLD: f64 = 600.0;

/// Budget for the source readiness probe.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic per-job deadline spread is capped here.
const MAX_SPREAD: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Fast,
    Slow,
}

impl Speed {
    pub fn as_str(self) -> &'static str {
        match self {
            Speed::Fast => "fast",
            Speed::Slow => "slow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Dead,
    WaitingDeadline,
    WaitingSlot(Speed),
    Running(Speed),
    Finished,
    Failed,
}

impl JobState {
    pub fn describe(self) -> String {
        match self {
            JobState::Dead => "dead".into(),
            JobState::WaitingDeadline => "waiting for deadline".into(),
            JobState::WaitingSlot(speed) => format!("waiting for worker slot ({})", speed.as_str()),
            JobState::Running(speed) => format!("running ({})", speed.as_str()),
            JobState::Finished => "finished".into(),
            JobState::Failed => "failed".into(),
        }
    }
}

/// Retry series: 2min, 4min, 8min, ... converging on 6 hours.
pub fn backoff_delay(errors: u32) -> Duration {
    const BASE_SECS: u64 = 2 * 60;
    const MAX_SECS: u64 = 6 * 60 * 60;
    let exp = errors.saturating_sub(1).min(16);
    Duration::from_secs(MAX_SECS.min(BASE_SECS.saturating_mul(1 << exp)))
}

/// Pool choice from the previous completed run. First runs count as fast.
pub fn speed_for(last_duration: Option<f64>) -> Speed {
    match last_duration {
        Some(d) if d >= SLOW_THRESHOLD => Speed::Slow,
        _ => Speed::Fast,
    }
}

/// Deterministic per-job deadline spread so many repositories with the
/// same schedule do not fire in lockstep. Bounded by a tenth of the
/// smallest interval and by [`MAX_SPREAD`].
pub fn spread_for(name: &str, schedule: &Schedule) -> Duration {
    let cap = schedule
        .smallest_interval()
        .and_then(|i| i.to_std().ok())
        .map(|i| i / 10)
        .unwrap_or(Duration::ZERO)
        .min(MAX_SPREAD);
    if cap.is_zero() {
        return Duration::ZERO;
    }
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    Duration::from_secs(hasher.finish() % cap.as_secs().max(1))
}

/// The dual worker pools gating concurrent backups. Long jobs must not
/// starve short ones: each speed class has its own reserved capacity.
#[derive(Clone)]
pub struct WorkerPools {
    pub fast: Arc<Semaphore>,
    pub slow: Arc<Semaphore>,
}

impl WorkerPools {
    pub fn new(limit: usize) -> Self {
        WorkerPools {
            fast: Arc::new(Semaphore::new(limit)),
            slow: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn pool(&self, speed: Speed) -> &Arc<Semaphore> {
        match speed {
            Speed::Fast => &self.fast,
            Speed::Slow => &self.slow,
        }
    }
}

/// Snapshot of one job for the status hook and the completion callback.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: String,
    pub sla: String,
    pub sla_overdue: i64,
    pub status: String,
    pub last_time: Option<DateTime<Utc>>,
    pub last_tags: Option<String>,
    pub last_duration: Option<f64>,
    pub next_time: Option<DateTime<Utc>>,
    pub next_tags: Option<String>,
    pub manual_tags: String,
    pub quarantine_reports: usize,
}

pub struct Job {
    pub name: String,
    repo_path: PathBuf,
    schedule: Schedule,
    source: SourceSpec,
    callback: Option<PathBuf>,
    pools: WorkerPools,

    run_immediately: Notify,
    stop_notify: Notify,
    stopping: AtomicBool,
    cancel: Arc<AtomicBool>,

    errors: AtomicU32,
    state: Mutex<JobState>,
    next: Mutex<Option<(DateTime<Utc>, Vec<String>)>>,
    last_duration: Mutex<Option<f64>>,
}

impl Job {
    /// Build a job and scaffold its repository directory, including the
    /// per-repo `config` file so standalone operations see the same
    /// schedule and source.
    pub fn configure(
        name: &str,
        base_dir: &std::path::Path,
        schedule_spec: &ScheduleSpec,
        source: &SourceSpec,
        callback: Option<PathBuf>,
        pools: WorkerPools,
    ) -> Result<Arc<Self>> {
        let repo_path = base_dir.join(name);
        std::fs::create_dir_all(&repo_path)?;
        let repo_config = RepoConfig {
            schedule: schedule_spec.clone(),
            source: source.clone(),
        };
        repo_config.store(&repo_path)?;
        let schedule = Schedule::configure(schedule_spec)?;

        let last_duration = Repository::open(&repo_path)?
            .latest_completed()
            .map(|r| r.duration);

        Ok(Arc::new(Job {
            name: name.to_string(),
            repo_path,
            schedule,
            source: source.clone(),
            callback,
            pools,
            run_immediately: Notify::new(),
            stop_notify: Notify::new(),
            stopping: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
            errors: AtomicU32::new(0),
            state: Mutex::new(JobState::Dead),
            next: Mutex::new(None),
            last_duration: Mutex::new(last_duration),
        }))
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap() = state;
        tracing::debug!(job = %self.name, status = %state.describe(), "updating status");
    }

    /// Ad-hoc trigger: skip the deadline. Does not reset the failure
    /// counter or backoff.
    pub fn trigger(&self) {
        info!(job = %self.name, "run requested");
        self.run_immediately.notify_one();
    }

    /// Ask the job loop to exit. A currently running backup is allowed to
    /// finish; all waits are cancelled.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    /// Hard-cancel a running backup at its next suspension point.
    pub fn cancel_running(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Collect the current status, scanning the repository fresh.
    pub fn status(&self) -> JobStatus {
        let now = Utc::now();
        let state = self.state();
        let running = matches!(state, JobState::Running(_));

        let (sla_overdue, last_time, last_tags, last_duration, manual_tags, quarantine) =
            match Repository::open(&self.repo_path) {
                Ok(repo) => {
                    let overdue = self.schedule.sla_overdue(&repo, now, running).unwrap_or(0);
                    let last = repo.latest_completed();
                    let manual: Vec<String> = repo
                        .clean_history()
                        .flat_map(|r| r.tags.iter())
                        .filter(|t| is_manual_tag(t))
                        .cloned()
                        .collect();
                    (
                        overdue,
                        last.map(|r| r.timestamp),
                        last.map(|r| self.schedule.sorted_tags(r.tags.iter()).join(",")),
                        last.map(|r| r.duration),
                        manual.join(", "),
                        repo.quarantine.report_count(),
                    )
                }
                Err(_) => (0, None, None, None, String::new(), 0),
            };

        let next = self.next.lock().unwrap().clone();
        JobStatus {
            job: self.name.clone(),
            sla: if sla_overdue == 0 { "OK" } else { "TOO OLD" }.to_string(),
            sla_overdue,
            status: state.describe(),
            last_time,
            last_tags,
            last_duration,
            next_time: next.as_ref().map(|(t, _)| *t),
            next_tags: next
                .as_ref()
                .map(|(_, tags)| self.schedule.sorted_tags(tags.iter()).join(",")),
            manual_tags,
            quarantine_reports: quarantine,
        }
    }

    /// The job loop. Runs until stopped; every iteration is one pass
    /// through the state machine.
    pub async fn run_forever(self: Arc<Self>) {
        info!(job = %self.name, "job loop started");
        let spread = spread_for(&self.name, &self.schedule);

        while !self.stopping() {
            // Compute the next deadline. Retries ignore the schedule and
            // only wait out the backoff, keeping the tags that would have
            // been due.
            let now = Utc::now();
            let (mut next_time, next_tags) = match self.next_deadline(now) {
                Some(v) => v,
                None => {
                    warn!(job = %self.name, "empty schedule, job going dead");
                    break;
                }
            };
            let errors = self.errors.load(Ordering::SeqCst);
            if errors > 0 {
                let delay = backoff_delay(errors);
                next_time = now + chrono::Duration::from_std(delay).unwrap();
            } else if next_time > now {
                next_time += chrono::Duration::from_std(spread).unwrap();
            }

            *self.next.lock().unwrap() = Some((next_time, next_tags.clone()));
            self.set_state(JobState::WaitingDeadline);
            info!(
                job = %self.name,
                next_time = %next_time.format("%Y-%m-%d %H:%M:%S UTC"),
                next_tags = %next_tags.join(","),
                "waiting"
            );
            if !self.wait_for_deadline(next_time).await {
                break;
            }
            *self.next.lock().unwrap() = None;

            // Pool pick from the previous completed duration.
            let speed = speed_for(*self.last_duration.lock().unwrap());
            self.set_state(JobState::WaitingSlot(speed));
            let permit = tokio::select! {
                permit = self.pools.pool(speed).clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.stop_notify.notified() => break,
            };

            self.set_state(JobState::Running(speed));
            let outcome = self.run_backup(next_tags).await;
            drop(permit);

            match outcome {
                Ok(duration) => {
                    self.errors.store(0, Ordering::SeqCst);
                    *self.last_duration.lock().unwrap() = Some(duration);
                    self.set_state(JobState::Finished);
                    self.run_callback().await;
                }
                Err(e) => {
                    let errors = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
                    let backoff = backoff_delay(errors);
                    if e.is_transient() {
                        info!(job = %self.name, error = %e, ?backoff, "source not ready, backing off");
                    } else {
                        warn!(job = %self.name, error = %e, errors, ?backoff, "backup failed");
                    }
                    self.set_state(JobState::Failed);
                }
            }
        }

        self.set_state(JobState::Dead);
        info!(job = %self.name, "job loop stopped");
    }

    fn next_deadline(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<String>)> {
        let repo = Repository::open(&self.repo_path).ok()?;
        let (when, tags) = self.schedule.next_due(&repo, now)?;
        Some((when, tags.into_iter().collect()))
    }

    /// Sleep until the deadline, an ad-hoc trigger, or a stop. Returns
    /// false when the job should exit.
    async fn wait_for_deadline(&self, deadline: DateTime<Utc>) -> bool {
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.run_immediately.notified() => {
                info!(job = %self.name, "woken by ad-hoc trigger");
                true
            }
            _ = self.stop_notify.notified() => false,
        }
    }

    /// Probe the source, then run backup + expiry + purge on the blocking
    /// pool. Returns the backup duration in seconds.
    async fn run_backup(&self, tags: Vec<String>) -> Result<f64> {
        // Fast readiness probe with its own timeout so a hung source does
        // not occupy the worker slot for long.
        let probe_spec = self.source.clone();
        let probe = tokio::time::timeout(
            READY_TIMEOUT,
            tokio::task::spawn_blocking(move || -> Result<()> {
                open_source(&probe_spec)?.ready()
            }),
        )
        .await;
        match probe {
            Err(_) => {
                return Err(BackyError::SourceUnavailable(
                    "readiness probe timed out".into(),
                ))
            }
            Ok(Err(_)) => return Err(BackyError::Other("readiness probe panicked".into())),
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Ok(Ok(()))) => {}
        }

        let path = self.repo_path.clone();
        let spec = self.source.clone();
        let schedule = self.schedule.clone();
        let cancel = Arc::clone(&self.cancel);
        let tag_set: std::collections::BTreeSet<String> = tags.into_iter().collect();

        let handle = tokio::task::spawn_blocking(move || -> Result<f64> {
            let mut repo = Repository::open(&path)?;
            let mut source = open_source(&spec)?;
            let uuid = ops::backup(&mut repo, &mut *source, tag_set, Some(&cancel))?;
            let duration = repo.get(&uuid).map(|r| r.duration).unwrap_or(0.0);
            ops::expire(&mut repo, &schedule)?;
            Ok(duration)
        });
        match handle.await {
            Ok(result) => result,
            Err(_) => Err(BackyError::Other("backup task panicked".into())),
        }
    }

    /// Invoke the completion callback with the job name as the first
    /// argument and the repository's YAML status on stdin. Failures are
    /// logged and change nothing.
    async fn run_callback(&self) {
        let Some(callback) = &self.callback else {
            return;
        };
        let status = self.status();
        let payload = match serde_yaml::to_string(&status) {
            Ok(p) => p,
            Err(e) => {
                warn!(job = %self.name, error = %e, "could not serialize status for callback");
                return;
            }
        };

        let spawned = tokio::process::Command::new(callback)
            .arg(&self.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                warn!(job = %self.name, callback = %callback.display(), error = %e, "callback failed to start");
                return;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                warn!(job = %self.name, error = %e, "callback stdin write failed");
            }
        }
        match child.wait().await {
            Ok(status) if status.success() => {
                info!(job = %self.name, "callback finished");
            }
            Ok(status) => {
                warn!(job = %self.name, ?status, "callback exited with failure");
            }
            Err(e) => {
                warn!(job = %self.name, error = %e, "callback wait failed");
            }
        }
    }
}
