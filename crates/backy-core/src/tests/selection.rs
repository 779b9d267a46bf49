use std::collections::BTreeSet;

use chrono::{Duration, Utc};

use crate::repo::format::{write_map, ChunkMap};
use crate::repo::{Repository, TagAction};
use crate::revision::{Revision, Trust};
use crate::testutil::test_repo;

fn add_revision(repo: &mut Repository, age_hours: i64, tags: &[&str], complete: bool) -> String {
    let tag_set: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
    let mut rev = Revision::create(tag_set);
    rev.timestamp = Utc::now() - Duration::hours(age_hours);
    if complete {
        rev.duration = 1.0;
    }
    rev.write_info(repo.path()).unwrap();
    write_map(repo.path(), &rev.uuid, &ChunkMap::new()).unwrap();
    let uuid = rev.uuid.clone();
    repo.scan().unwrap();
    uuid
}

#[test]
fn find_by_number_counts_from_newest() {
    let (_dir, mut repo) = test_repo();
    let oldest = add_revision(&mut repo, 48, &["daily"], true);
    let middle = add_revision(&mut repo, 24, &["daily"], true);
    let newest = add_revision(&mut repo, 1, &["daily"], true);

    assert_eq!(repo.find("0").unwrap().uuid, newest);
    assert_eq!(repo.find("1").unwrap().uuid, middle);
    assert_eq!(repo.find("2").unwrap().uuid, oldest);
    assert!(repo.find("3").is_err());
}

#[test]
fn find_by_number_skips_incomplete() {
    let (_dir, mut repo) = test_repo();
    let complete = add_revision(&mut repo, 24, &["daily"], true);
    add_revision(&mut repo, 1, &["daily"], false);

    assert_eq!(repo.find("0").unwrap().uuid, complete);
}

#[test]
fn find_latest_and_last_are_synonyms() {
    let (_dir, mut repo) = test_repo();
    add_revision(&mut repo, 24, &["daily"], true);
    let newest = add_revision(&mut repo, 1, &["daily"], true);

    assert_eq!(repo.find("latest").unwrap().uuid, newest);
    assert_eq!(repo.find("last").unwrap().uuid, newest);
}

#[test]
fn find_by_uuid_and_tag() {
    let (_dir, mut repo) = test_repo();
    let daily = add_revision(&mut repo, 24, &["daily"], true);
    let weekly = add_revision(&mut repo, 1, &["weekly"], true);

    assert_eq!(repo.find(&daily).unwrap().uuid, daily);
    assert_eq!(repo.find("weekly").unwrap().uuid, weekly);
    // A tag resolves to the newest bearer.
    let newer_daily = add_revision(&mut repo, 0, &["daily"], true);
    assert_eq!(repo.find("daily").unwrap().uuid, newer_daily);
    assert!(repo.find("monthly").is_err());
}

#[test]
fn find_revisions_all() {
    let (_dir, mut repo) = test_repo();
    add_revision(&mut repo, 24, &["daily"], true);
    add_revision(&mut repo, 1, &["daily"], true);
    assert_eq!(repo.find_revisions("all").unwrap().len(), 2);
}

#[test]
fn forget_removes_files_and_history() {
    let (_dir, mut repo) = test_repo();
    let uuid = add_revision(&mut repo, 1, &["daily"], true);
    let info = repo.path().join(format!("{uuid}.rev"));
    let map = repo.path().join(&uuid);
    assert!(info.exists() && map.exists());

    repo.forget(&uuid).unwrap();
    assert!(repo.get(&uuid).is_none());
    assert!(!info.exists());
    assert!(!map.exists());
}

#[test]
fn clean_incomplete_drops_stale_runs() {
    let (_dir, mut repo) = test_repo();
    let complete = add_revision(&mut repo, 24, &["daily"], true);
    let stale = add_revision(&mut repo, 1, &["daily"], false);

    repo.clean_incomplete().unwrap();
    assert!(repo.get(&complete).is_some());
    assert!(repo.get(&stale).is_none());
}

#[test]
fn distrust_all_marks_everything_and_enables_paranoia() {
    let (_dir, mut repo) = test_repo();
    add_revision(&mut repo, 24, &["daily"], true);
    add_revision(&mut repo, 1, &["daily"], true);
    assert!(!repo.store.force_writes());

    repo.distrust_all().unwrap();
    assert!(repo.history().iter().all(|r| r.trust == Trust::Distrusted));
    assert!(repo.store.force_writes());

    // The distrust state survives a rescan (it was written to disk).
    repo.scan().unwrap();
    assert!(repo.contains_distrusted());
}

#[test]
fn edit_tags_set_add_remove() {
    let (_dir, mut repo) = test_repo();
    let uuid = add_revision(&mut repo, 1, &["daily"], true);

    let weekly: BTreeSet<String> = ["weekly".to_string()].into();
    repo.edit_tags(&uuid, TagAction::Add, &weekly, false).unwrap();
    assert!(repo.get(&uuid).unwrap().tags.contains("weekly"));

    let daily: BTreeSet<String> = ["daily".to_string()].into();
    repo.edit_tags(&uuid, TagAction::Remove, &daily, false).unwrap();
    assert!(!repo.get(&uuid).unwrap().tags.contains("daily"));

    let manual: BTreeSet<String> = ["manual:keep".to_string()].into();
    repo.edit_tags(&uuid, TagAction::Set, &manual, false).unwrap();
    assert_eq!(repo.get(&uuid).unwrap().tags, manual);
}

#[test]
fn edit_tags_autoremove_drops_untagged() {
    let (_dir, mut repo) = test_repo();
    let uuid = add_revision(&mut repo, 1, &["daily"], true);
    let daily: BTreeSet<String> = ["daily".to_string()].into();
    repo.edit_tags(&uuid, TagAction::Remove, &daily, true).unwrap();
    assert!(repo.get(&uuid).is_none());
}

#[test]
fn trust_serializes_uppercase() {
    let (_dir, mut repo) = test_repo();
    let uuid = add_revision(&mut repo, 1, &["daily"], true);
    let raw = std::fs::read_to_string(repo.path().join(format!("{uuid}.rev"))).unwrap();
    assert!(raw.contains("TRUSTED"));
}
