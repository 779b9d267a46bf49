//! End-to-end scenarios driving real file sources through backup,
//! restore, verification, expiry and locking.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use backy_core::config::SourceSpec;
use backy_core::ops::{self, RestoreTarget};
use backy_core::repo::lock::RepoLock;
use backy_core::repo::Repository;
use backy_core::revision::{Revision, Trust};
use backy_core::schedule::{Schedule, TagPolicyConfig};
use backy_core::source::{file::FileSource, open_source};
use backy_core::{BackyError, CHUNK_SIZE};

const MIB: usize = 1024 * 1024;

fn tags(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|t| t.to_string()).collect()
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state & 0xFF) as u8
        })
        .collect()
}

fn write_image(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}

fn backup_file(repo: &mut Repository, image: &Path, tag_names: &[&str]) -> String {
    let mut source = FileSource::new(image, false);
    ops::backup(repo, &mut source, tags(tag_names), None).unwrap()
}

fn restore_to(repo: &mut Repository, spec: &str, target: &Path) {
    ops::restore(repo, spec, &RestoreTarget::Path(target.to_path_buf())).unwrap();
}

fn count_chunk_files(repo: &Repository) -> usize {
    let mut count = 0;
    for shard in 0u16..256 {
        let dir = repo.path().join("chunks").join(format!("{shard:02x}"));
        if let Ok(entries) = fs::read_dir(&dir) {
            count += entries
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .ends_with(".chunk.lzo")
                })
                .count();
        }
    }
    count
}

fn daily_schedule(keep: usize) -> Schedule {
    let config = [(
        "daily".to_string(),
        TagPolicyConfig {
            interval: "1d".into(),
            keep,
        },
    )]
    .into_iter()
    .collect();
    Schedule::configure(&config).unwrap()
}

#[test]
fn single_backup_of_a_12_mib_image() {
    let work = tempfile::tempdir().unwrap();
    let image = random_bytes(12 * MIB, 1);
    let image_path = write_image(work.path(), "disk.img", &image);
    let mut repo = Repository::open(&work.path().join("repo")).unwrap();

    let uuid = backup_file(&mut repo, &image_path, &["daily"]);

    assert_eq!(count_chunk_files(&repo), 3);
    let rev = repo.get(&uuid).unwrap();
    assert_eq!(rev.size, 12_582_912);
    assert_eq!(rev.trust, Trust::Trusted);
    assert_eq!(rev.stats.chunks_written, 3);

    let target = work.path().join("restored.img");
    restore_to(&mut repo, &uuid, &target);
    assert_eq!(fs::read(&target).unwrap(), image);
}

#[test]
fn single_byte_mutation_costs_one_chunk() {
    let work = tempfile::tempdir().unwrap();
    let image = random_bytes(12 * MIB, 2);
    let image_path = write_image(work.path(), "disk.img", &image);
    let mut repo = Repository::open(&work.path().join("repo")).unwrap();

    backup_file(&mut repo, &image_path, &["daily"]);
    assert_eq!(count_chunk_files(&repo), 3);

    // Flip one byte in the middle 4 MiB block.
    let mut mutated = image.clone();
    mutated[6 * MIB] ^= 0x01;
    fs::write(&image_path, &mutated).unwrap();
    let second = backup_file(&mut repo, &image_path, &["daily"]);

    assert_eq!(count_chunk_files(&repo), 4);

    let target = work.path().join("new.img");
    restore_to(&mut repo, &second, &target);
    assert_eq!(fs::read(&target).unwrap(), mutated);

    // Revision 1 (the next older) still restores the original input.
    let target = work.path().join("old.img");
    restore_to(&mut repo, "1", &target);
    assert_eq!(fs::read(&target).unwrap(), image);
}

#[test]
fn sparse_image_stores_only_data_blocks() {
    let work = tempfile::tempdir().unwrap();
    let size: u64 = 1024 * 1024 * 1024;
    let head = random_bytes(CHUNK_SIZE, 3);
    let tail = random_bytes(CHUNK_SIZE, 4);

    let image_path = work.path().join("sparse.img");
    {
        let mut f = File::create(&image_path).unwrap();
        f.write_all(&head).unwrap();
        f.seek(SeekFrom::Start(size - CHUNK_SIZE as u64)).unwrap();
        f.write_all(&tail).unwrap();
    }

    let mut repo = Repository::open(&work.path().join("repo")).unwrap();
    let uuid = backup_file(&mut repo, &image_path, &["daily"]);

    assert_eq!(count_chunk_files(&repo), 2);
    assert_eq!(repo.get(&uuid).unwrap().size, 1_073_741_824);

    let target = work.path().join("restored.img");
    restore_to(&mut repo, &uuid, &target);
    let mut f = File::open(&target).unwrap();
    assert_eq!(f.metadata().unwrap().len(), size);

    let mut buf = vec![0u8; CHUNK_SIZE];
    f.read_exact(&mut buf).unwrap();
    assert_eq!(buf, head);
    // Sample the middle: must be all zero.
    f.seek(SeekFrom::Start(size / 2)).unwrap();
    let mut mid = vec![0u8; 4096];
    f.read_exact(&mut mid).unwrap();
    assert!(mid.iter().all(|&b| b == 0));
    f.seek(SeekFrom::Start(size - CHUNK_SIZE as u64)).unwrap();
    f.read_exact(&mut buf).unwrap();
    assert_eq!(buf, tail);
}

#[test]
fn distrust_flow_forces_full_backup_and_recovers() {
    let work = tempfile::tempdir().unwrap();
    let image = random_bytes(8 * MIB, 5);
    let image_path = write_image(work.path(), "disk.img", &image);
    let mut repo = Repository::open(&work.path().join("repo")).unwrap();

    let first = backup_file(&mut repo, &image_path, &["daily"]);

    // Corrupt one chunk file on disk (flip a byte in the LZO stream).
    let map = repo.load_map(&first).unwrap();
    let id = *map.values().next().unwrap();
    let chunk_path = repo.store.chunk_path(&id);
    let mut raw = fs::read(&chunk_path).unwrap();
    let mid = raw.len() / 2;
    raw[mid] ^= 0xFF;
    fs::write(&chunk_path, &raw).unwrap();

    // The next read of that chunk raises an integrity error and every
    // revision becomes distrusted.
    let target = work.path().join("restored.img");
    let err = ops::restore(&mut repo, &first, &RestoreTarget::Path(target)).unwrap_err();
    assert!(matches!(err, BackyError::Integrity(_)));
    assert!(repo.contains_distrusted());

    // The next backup runs full: every chunk is written regardless of
    // the dedup index, which also rewrites the corrupt file with good
    // content. The follow-up verification then clears the distrust.
    let second = backup_file(&mut repo, &image_path, &["daily"]);
    let rev = repo.get(&second).unwrap();
    assert_eq!(rev.stats.chunks_written, 2);
    assert_eq!(repo.get(&first).unwrap().trust, Trust::Verified);
    assert!(!repo.contains_distrusted());

    assert!(ops::verify(&mut repo, None, Some(&second)).unwrap());
    assert_eq!(repo.get(&second).unwrap().trust, Trust::Verified);

    let target = work.path().join("recovered.img");
    restore_to(&mut repo, &second, &target);
    assert_eq!(fs::read(&target).unwrap(), image);
}

#[test]
fn expiry_removes_untagged_revisions_and_their_chunks() {
    let work = tempfile::tempdir().unwrap();
    let mut repo = Repository::open(&work.path().join("repo")).unwrap();
    let schedule = daily_schedule(3);

    let mut uuids = Vec::new();
    for day in 0..5u64 {
        let image = random_bytes(4 * MIB, 100 + day);
        let image_path = write_image(work.path(), "disk.img", &image);
        uuids.push(backup_file(&mut repo, &image_path, &["daily"]));
    }

    // Space the revisions a day apart, oldest first.
    for (i, uuid) in uuids.iter().enumerate() {
        let info = repo.path().join(format!("{uuid}.rev"));
        let mut rev = Revision::load(&info).unwrap();
        rev.timestamp = chrono::Utc::now() - chrono::Duration::days(4 - i as i64);
        rev.write_info(repo.path()).unwrap();
    }
    repo.scan().unwrap();

    assert_eq!(count_chunk_files(&repo), 5);
    ops::expire(&mut repo, &schedule).unwrap();
    repo.scan().unwrap();

    let remaining: Vec<String> = repo.history().iter().map(|r| r.uuid.clone()).collect();
    assert_eq!(remaining, uuids[2..].to_vec());
    assert_eq!(count_chunk_files(&repo), 3);
}

#[test]
fn concurrent_mutation_fails_with_lock_held() {
    let work = tempfile::tempdir().unwrap();
    let image_path = write_image(work.path(), "disk.img", &random_bytes(MIB, 6));
    let mut repo = Repository::open(&work.path().join("repo")).unwrap();

    let held = RepoLock::exclusive(repo.path()).unwrap();
    let mut source = FileSource::new(&image_path, false);
    let err = ops::backup(&mut repo, &mut source, tags(&["daily"]), None).unwrap_err();
    assert!(matches!(err, BackyError::LockHeld(_)));
    drop(held);

    assert!(ops::backup(&mut repo, &mut source, tags(&["daily"]), None).is_ok());
}

#[test]
fn shared_locks_allow_concurrent_reads() {
    let work = tempfile::tempdir().unwrap();
    let repo = Repository::open(&work.path().join("repo")).unwrap();
    let a = RepoLock::shared(repo.path()).unwrap();
    let b = RepoLock::shared(repo.path()).unwrap();
    drop((a, b));
}

#[test]
fn source_specs_build_adapters() {
    let specs = [
        SourceSpec::File {
            filename: "/tmp/x.img".into(),
            full_always: false,
        },
        SourceSpec::CephRbd {
            pool: "rbd".into(),
            image: "vm.root".into(),
            full_always: false,
        },
        SourceSpec::Flyingcircus {
            pool: "rbd".into(),
            image: "vm.root".into(),
            vm: "vm01".into(),
            full_always: true,
        },
    ];
    for spec in &specs {
        assert!(open_source(spec).is_ok());
    }
}

#[test]
fn repo_config_roundtrips_through_yaml() {
    let work = tempfile::tempdir().unwrap();
    let config = backy_core::config::RepoConfig {
        schedule: [(
            "daily".to_string(),
            TagPolicyConfig {
                interval: "1d".into(),
                keep: 7,
            },
        )]
        .into_iter()
        .collect(),
        source: SourceSpec::File {
            filename: "/srv/image".into(),
            full_always: false,
        },
    };
    config.store(work.path()).unwrap();
    let loaded = backy_core::config::RepoConfig::load(work.path()).unwrap();
    assert_eq!(loaded, config);
    assert!(loaded.schedule().is_ok());
}
