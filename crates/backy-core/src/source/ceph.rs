//! Ceph RBD source.
//!
//! Drives the `rbd` CLI: snapshot lifecycle, read-only mapping for block
//! reads, and `export-diff` for changed-block discovery between the
//! parent revision's snapshot and the fresh one. Snapshots are named
//! `backy-<revision uuid>`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info, warn};

use backy_types::{BackyError, Result};

use crate::revision::Revision;
use crate::CHUNK_SIZE;

use super::{BlockSelection, Source};

const SNAP_PREFIX: &str = "backy-";

#[derive(Debug, Deserialize)]
pub struct SnapEntry {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageInfo {
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct MappedEntry {
    pool: String,
    name: String,
    snap: String,
    device: String,
}

/// Thin wrapper around the `rbd` command line tool.
#[derive(Debug, Default)]
pub struct RbdClient;

impl RbdClient {
    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(?args, "rbd");
        let output = Command::new("rbd")
            .arg("--no-progress")
            .args(args)
            .output()
            .map_err(|e| BackyError::SourceUnavailable(format!("rbd not runnable: {e}")))?;
        if !output.status.success() {
            return Err(BackyError::SourceUnavailable(format!(
                "rbd {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn run_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let mut full = vec!["--format", "json"];
        full.extend_from_slice(args);
        let raw = self.run(&full)?;
        serde_json::from_slice(&raw)
            .map_err(|e| BackyError::InvalidFormat(format!("rbd json output: {e}")))
    }

    pub fn info(&self, image: &str) -> Result<ImageInfo> {
        self.run_json(&["info", image])
    }

    pub fn snap_ls(&self, image: &str) -> Result<Vec<SnapEntry>> {
        self.run_json(&["snap", "ls", image])
    }

    pub fn snap_exists(&self, image: &str, snap: &str) -> Result<bool> {
        Ok(self.snap_ls(image)?.iter().any(|s| s.name == snap))
    }

    pub fn snap_create(&self, image: &str, snap: &str) -> Result<()> {
        self.run(&["snap", "create", &format!("{image}@{snap}")])?;
        Ok(())
    }

    pub fn snap_rm(&self, image: &str, snap: &str) -> Result<()> {
        self.run(&["snap", "rm", &format!("{image}@{snap}")])?;
        Ok(())
    }

    pub fn map_read_only(&self, image: &str, snap: &str) -> Result<PathBuf> {
        self.run(&["map", "--read-only", &format!("{image}@{snap}")])?;
        let mapped: std::collections::HashMap<String, MappedEntry> =
            self.run_json(&["showmapped"])?;
        let (pool, name) = image
            .split_once('/')
            .ok_or_else(|| BackyError::Config(format!("image '{image}' is not POOL/IMAGE")))?;
        mapped
            .into_values()
            .find(|m| m.pool == pool && m.name == name && m.snap == snap)
            .map(|m| PathBuf::from(m.device))
            .ok_or_else(|| {
                BackyError::SourceUnavailable(format!("no mapping found for {image}@{snap}"))
            })
    }

    pub fn unmap(&self, device: &Path) -> Result<()> {
        self.run(&["unmap", &device.display().to_string()])?;
        Ok(())
    }

    pub fn export_diff(
        &self,
        image: &str,
        snap: &str,
        from_snap: &str,
        target: &Path,
    ) -> Result<()> {
        self.run(&[
            "export-diff",
            &format!("{image}@{snap}"),
            "--from-snap",
            from_snap,
            &target.display().to_string(),
        ])?;
        Ok(())
    }
}

pub struct CephSource {
    pool: String,
    image: String,
    full_always: bool,
    rbd: RbdClient,
    /// Snapshot backing the current backup run.
    snapshot: Option<String>,
    /// Read-only device mapping of that snapshot.
    device: Option<(PathBuf, File)>,
    size: Option<u64>,
}

impl CephSource {
    pub fn new(pool: &str, image: &str, full_always: bool) -> Self {
        CephSource {
            pool: pool.to_string(),
            image: image.to_string(),
            full_always,
            rbd: RbdClient,
            snapshot: None,
            device: None,
            size: None,
        }
    }

    fn image_name(&self) -> String {
        format!("{}/{}", self.pool, self.image)
    }

    fn snap_name(uuid: &str) -> String {
        format!("{SNAP_PREFIX}{uuid}")
    }

    /// Create (or reuse) the snapshot for this run.
    fn ensure_snapshot(&mut self, snap: &str) -> Result<()> {
        let image = self.image_name();
        if self.rbd.snap_exists(&image, snap)? {
            info!(snapshot = snap, "re-using existing snapshot");
        } else {
            info!(snapshot = snap, "creating snapshot");
            self.rbd.snap_create(&image, snap)?;
        }
        Ok(())
    }

    fn map_snapshot(&mut self, snap: &str) -> Result<()> {
        let image = self.image_name();
        let device = self.rbd.map_read_only(&image, snap)?;
        let file = File::open(&device)?;
        self.device = Some((device, file));
        self.snapshot = Some(snap.to_string());
        Ok(())
    }

    /// Remove stale `backy-*` snapshots, keeping only `keep`.
    fn clean_snapshots(&self, keep: Option<&str>) -> Result<()> {
        let image = self.image_name();
        for snap in self.rbd.snap_ls(&image)? {
            if !snap.name.starts_with(SNAP_PREFIX) {
                continue;
            }
            if Some(snap.name.as_str()) == keep {
                continue;
            }
            info!(snapshot = %snap.name, "removing old snapshot");
            if let Err(e) = self.rbd.snap_rm(&image, &snap.name) {
                warn!(snapshot = %snap.name, error = %e, "snapshot removal failed");
            }
        }
        Ok(())
    }

    /// Parse an `rbd export-diff` stream and collect the touched block
    /// indices. Both data (`w`) and zero (`z`) records count as changed.
    fn changed_blocks_from_diff(path: &Path) -> Result<Vec<u32>> {
        let mut f = File::open(path)?;
        let mut header = [0u8; 12];
        f.read_exact(&mut header)?;
        if &header != b"rbd diff v1\n" {
            return Err(BackyError::InvalidFormat(
                "unexpected rbd diff header".into(),
            ));
        }

        let mut blocks = std::collections::BTreeSet::new();
        loop {
            let mut tag = [0u8; 1];
            if f.read_exact(&mut tag).is_err() {
                break;
            }
            match tag[0] {
                b'e' => break,
                b'f' | b't' => {
                    // snapshot name: u32 length + bytes
                    let len = read_u32(&mut f)?;
                    f.seek(SeekFrom::Current(len as i64))?;
                }
                b's' => {
                    let _size = read_u64(&mut f)?;
                }
                b'w' | b'z' => {
                    let offset = read_u64(&mut f)?;
                    let length = read_u64(&mut f)?;
                    if tag[0] == b'w' {
                        f.seek(SeekFrom::Current(length as i64))?;
                    }
                    if length > 0 {
                        let first = (offset / CHUNK_SIZE as u64) as u32;
                        let last = ((offset + length - 1) / CHUNK_SIZE as u64) as u32;
                        blocks.extend(first..=last);
                    }
                }
                other => {
                    return Err(BackyError::InvalidFormat(format!(
                        "unknown rbd diff record type {other:#x}"
                    )));
                }
            }
        }
        Ok(blocks.into_iter().collect())
    }
}

fn read_u32(f: &mut File) -> Result<u32> {
    let mut buf = [0u8; 4];
    f.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(f: &mut File) -> Result<u64> {
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl Source for CephSource {
    fn size(&mut self) -> Result<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let info = self.rbd.info(&self.image_name())?;
        self.size = Some(info.size);
        Ok(info.size)
    }

    fn ready(&mut self) -> Result<()> {
        self.rbd.info(&self.image_name()).map(|_| ())
    }

    fn blocks_to_examine(&mut self, parent: Option<&Revision>) -> Result<BlockSelection> {
        if self.full_always {
            debug!("full-always configured, examining all blocks");
            return Ok(BlockSelection::All);
        }
        let Some(parent) = parent else {
            info!("no parent revision, reading full snapshot");
            return Ok(BlockSelection::All);
        };
        let image = self.image_name();
        let parent_snap = Self::snap_name(&parent.uuid);
        if !self.rbd.snap_exists(&image, &parent_snap)? {
            info!("parent snapshot is gone, reading full snapshot");
            return Ok(BlockSelection::All);
        }
        let snap = self
            .snapshot
            .clone()
            .ok_or_else(|| BackyError::Other("blocks_to_examine without a snapshot".into()))?;

        let diff_file = tempfile::Builder::new()
            .prefix(".rbddiff.")
            .tempfile()?;
        self.rbd
            .export_diff(&image, &snap, &parent_snap, diff_file.path())?;
        let blocks = Self::changed_blocks_from_diff(diff_file.path())?;
        info!(blocks = blocks.len(), "snapshot diff enumerated changed blocks");
        Ok(BlockSelection::Blocks(blocks))
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>> {
        let size = self.size()?;
        let offset = index as u64 * CHUNK_SIZE as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let want = CHUNK_SIZE.min((size - offset) as usize);
        let (_, file) = self
            .device
            .as_mut()
            .ok_or_else(|| BackyError::Other("read_block without a mapped snapshot".into()))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)
            .map_err(|e| BackyError::SourceCorrupt {
                offset,
                detail: e.to_string(),
            })?;
        Ok(buf)
    }

    fn snapshot_begin(&mut self, revision_uuid: &str) -> Result<()> {
        let snap = Self::snap_name(revision_uuid);
        self.ensure_snapshot(&snap)?;
        self.map_snapshot(&snap)
    }

    fn snapshot_end(&mut self, commit: bool) -> Result<()> {
        if let Some((device, file)) = self.device.take() {
            drop(file);
            if let Err(e) = self.rbd.unmap(&device) {
                warn!(device = %device.display(), error = %e, "unmap failed");
            }
        }
        let snap = self.snapshot.take();
        if commit {
            // The fresh snapshot is the diff base for the next backup.
            self.clean_snapshots(snap.as_deref())?;
        } else if let Some(snap) = snap {
            // Failed run: drop our snapshot, keep the parent's for the
            // next delta.
            if let Err(e) = self.rbd.snap_rm(&self.image_name(), &snap) {
                warn!(snapshot = %snap, error = %e, "snapshot removal failed");
            }
        }
        Ok(())
    }
}
