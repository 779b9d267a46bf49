//! Tag-based retention.
//!
//! A schedule is an ordered mapping `tag → {interval, keep}`. The engine
//! computes when each tag is next due, expires tags past their keep
//! count, removes revisions whose tag set becomes empty, and answers the
//! SLA question (a tag is overdue once 1.5 intervals have elapsed past
//! the newest revision bearing it).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use backy_types::{BackyError, Result};

use crate::repo::Repository;
use crate::revision::{is_manual_tag, Revision};

/// Parse an interval: integer plus `s|m|h|d|w` suffix. A bare integer is
/// taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(BackyError::Config("empty interval".into()));
    }
    if let Ok(n) = s.parse::<i64>() {
        return Ok(Duration::seconds(n));
    }
    let (num, suffix) = s.split_at(s.len() - 1);
    let n: i64 = num
        .parse()
        .map_err(|_| BackyError::Config(format!("invalid interval '{s}'")))?;
    match suffix {
        "s" => Ok(Duration::seconds(n)),
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        "w" => Ok(Duration::weeks(n)),
        _ => Err(BackyError::Config(format!(
            "unknown interval suffix '{suffix}'"
        ))),
    }
}

/// One tag's schedule entry as written in config files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagPolicyConfig {
    pub interval: String,
    pub keep: usize,
}

#[derive(Debug, Clone)]
struct TagPolicy {
    interval: Duration,
    keep: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    tags: BTreeMap<String, TagPolicy>,
}

impl Schedule {
    pub fn configure(config: &BTreeMap<String, TagPolicyConfig>) -> Result<Self> {
        let mut tags = BTreeMap::new();
        for (tag, spec) in config {
            if spec.keep == 0 {
                return Err(BackyError::Config(format!(
                    "schedule tag '{tag}' must keep at least one revision"
                )));
            }
            tags.insert(
                tag.clone(),
                TagPolicy {
                    interval: parse_duration(&spec.interval)?,
                    keep: spec.keep,
                },
            );
        }
        Ok(Schedule { tags })
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &String> {
        self.tags.keys()
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    pub fn smallest_interval(&self) -> Option<Duration> {
        self.tags.values().map(|p| p.interval).min()
    }

    /// The timestamp of the newest completed revision bearing each tag.
    fn last_by_tag<'a>(
        &self,
        history: impl Iterator<Item = &'a Revision>,
    ) -> HashMap<String, DateTime<Utc>> {
        let mut last: HashMap<String, DateTime<Utc>> = HashMap::new();
        for rev in history.filter(|r| r.is_complete()) {
            for tag in &rev.tags {
                let slot = last.entry(tag.clone()).or_insert(rev.timestamp);
                if rev.timestamp > *slot {
                    *slot = rev.timestamp;
                }
            }
        }
        last
    }

    /// When is `tag` next due? `None` means due immediately (never backed
    /// up under this tag).
    fn fire_time(
        &self,
        tag: &str,
        last: &HashMap<String, DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let policy = &self.tags[tag];
        last.get(tag).map(|newest| *newest + policy.interval)
    }

    /// Earliest due time across all tags, with the tags firing then.
    /// Tags never backed up fire at `now`.
    pub fn next_due(&self, repo: &Repository, now: DateTime<Utc>) -> Option<(DateTime<Utc>, BTreeSet<String>)> {
        if self.tags.is_empty() {
            return None;
        }
        let last = self.last_by_tag(repo.history().iter());
        let fires: Vec<(String, DateTime<Utc>)> = self
            .tags
            .keys()
            .map(|tag| (tag.clone(), self.fire_time(tag, &last).unwrap_or(now)))
            .collect();
        let when = fires
            .iter()
            .map(|(_, fire)| *fire)
            .min()
            .expect("schedule has tags");
        let tags = fires
            .into_iter()
            .filter(|(_, fire)| *fire <= when)
            .map(|(tag, _)| tag)
            .collect();
        Some((when, tags))
    }

    /// All tags whose fire time is at or before `now`.
    pub fn due_tags(&self, repo: &Repository, now: DateTime<Utc>) -> BTreeSet<String> {
        let last = self.last_by_tag(repo.history().iter());
        self.tags
            .keys()
            .filter(|tag| match self.fire_time(tag, &last) {
                Some(fire) => fire <= now,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Expire tags past their keep count, then remove revisions whose
    /// tag set became empty. Returns the removed uuids. The caller holds
    /// the exclusive lock and runs `purge` afterwards.
    pub fn expire(&self, repo: &mut Repository) -> Result<Vec<String>> {
        let repo_path = repo.path().to_path_buf();

        // Phase 1: strip expired schedule tags. `manual:*` tags are never
        // schedule tags and thus never touched.
        for (tag, policy) in &self.tags {
            let bearing: Vec<String> = repo
                .history()
                .iter()
                .filter(|r| r.is_complete() && r.tags.contains(tag))
                .map(|r| r.uuid.clone())
                .collect();
            if bearing.len() <= policy.keep {
                continue;
            }
            let expired = &bearing[..bearing.len() - policy.keep];
            for uuid in expired {
                let rev = repo.get_mut(uuid).expect("uuid from history");
                rev.tags.remove(tag);
                rev.write_info(&repo_path)?;
            }
        }

        // Phase 2: drop revisions that no longer carry any tag.
        let untagged: Vec<String> = repo
            .history()
            .iter()
            .filter(|r| r.is_complete() && r.tags.is_empty())
            .map(|r| r.uuid.clone())
            .collect();
        for uuid in &untagged {
            repo.forget(uuid)?;
        }
        if !untagged.is_empty() {
            info!(removed = untagged.len(), "expiry removed untagged revisions");
        }
        Ok(untagged)
    }

    /// Seconds the SLA is currently overdue, or `None` when held. A tag
    /// is overdue once 1.5 intervals have passed since the newest
    /// revision bearing it; a job that is running is never counted as
    /// violating.
    pub fn sla_overdue(
        &self,
        repo: &Repository,
        now: DateTime<Utc>,
        running: bool,
    ) -> Option<i64> {
        if running {
            return None;
        }
        let last = self.last_by_tag(repo.history().iter());
        let mut worst: Option<i64> = None;
        for (tag, policy) in &self.tags {
            let Some(newest) = last.get(tag) else { continue };
            let deadline = *newest + policy.interval + policy.interval / 2;
            if now > deadline {
                let overdue = (now - *newest).num_seconds();
                worst = Some(worst.map_or(overdue, |w: i64| w.max(overdue)));
            }
        }
        worst
    }

    /// Tags sorted by their interval, smallest first. Tags outside the
    /// schedule (e.g. `manual:*`) count as zero-interval and sort first.
    pub fn sorted_tags<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut out: Vec<(&String, Duration)> = tags
            .into_iter()
            .map(|t| {
                let interval = self
                    .tags
                    .get(t)
                    .map(|p| p.interval)
                    .unwrap_or_else(Duration::zero);
                (t, interval)
            })
            .collect();
        out.sort_by_key(|(_, interval)| *interval);
        out.into_iter().map(|(t, _)| t.clone()).collect()
    }

    /// Reject tags that are neither in the schedule nor `manual:*`.
    pub fn validate_tags<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> Result<()> {
        let unknown: Vec<&String> = tags
            .into_iter()
            .filter(|t| !is_manual_tag(t) && !self.tags.contains_key(*t))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(BackyError::Config(format!(
                "tags missing from the schedule: {}",
                unknown
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }
}
