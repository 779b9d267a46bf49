//! Virtualised Ceph RBD source.
//!
//! Identical to [`CephSource`] except that snapshot creation first asks
//! the guest to quiesce its filesystems through an external freeze
//! command. When the freeze times out or fails (the VM may simply be
//! shut down), the backup falls back to a plain Ceph snapshot.

use std::process::Command;

use tracing::{info, warn};

use backy_types::Result;

use crate::revision::Revision;

use super::ceph::CephSource;
use super::{BlockSelection, Source};

const FREEZE_CMD: &str = "fc-backy-freeze";
const THAW_CMD: &str = "fc-backy-thaw";

pub struct FlyingCircusSource {
    inner: CephSource,
    vm: String,
    frozen: bool,
}

impl FlyingCircusSource {
    pub fn new(pool: &str, image: &str, vm: &str, full_always: bool) -> Self {
        FlyingCircusSource {
            inner: CephSource::new(pool, image, full_always),
            vm: vm.to_string(),
            frozen: false,
        }
    }

    fn run_guest_cmd(&self, cmd: &str) -> std::io::Result<bool> {
        let status = Command::new(cmd).arg(&self.vm).status()?;
        Ok(status.success())
    }

    fn freeze(&mut self) {
        match self.run_guest_cmd(FREEZE_CMD) {
            Ok(true) => {
                info!(vm = %self.vm, "guest filesystems frozen");
                self.frozen = true;
            }
            Ok(false) => {
                warn!(vm = %self.vm, "freeze command refused, taking plain snapshot");
            }
            Err(e) => {
                warn!(vm = %self.vm, error = %e, "freeze command unavailable, taking plain snapshot");
            }
        }
    }

    fn thaw(&mut self) {
        if !self.frozen {
            return;
        }
        self.frozen = false;
        match self.run_guest_cmd(THAW_CMD) {
            Ok(true) => info!(vm = %self.vm, "guest filesystems thawed"),
            Ok(false) | Err(_) => {
                // The guest agent thaws on its own after a grace period.
                warn!(vm = %self.vm, "thaw command failed");
            }
        }
    }
}

impl Source for FlyingCircusSource {
    fn size(&mut self) -> Result<u64> {
        self.inner.size()
    }

    fn ready(&mut self) -> Result<()> {
        self.inner.ready()
    }

    fn blocks_to_examine(&mut self, parent: Option<&Revision>) -> Result<BlockSelection> {
        self.inner.blocks_to_examine(parent)
    }

    fn read_block(&mut self, index: u32) -> Result<Vec<u8>> {
        self.inner.read_block(index)
    }

    fn snapshot_begin(&mut self, revision_uuid: &str) -> Result<()> {
        self.freeze();
        let result = self.inner.snapshot_begin(revision_uuid);
        // The snapshot is taken (or failed); the guest must not stay
        // frozen either way.
        self.thaw();
        result
    }

    fn snapshot_end(&mut self, commit: bool) -> Result<()> {
        self.inner.snapshot_end(commit)
    }
}
