//! Mounting partitions, scoped mounts, and releasing a drive's partitions.
//!
//! The central invariant of a run is that no partition of the card is mounted
//! when it is flashed or ejected. [`MountGuard`] ties a mount to a scope: it is
//! released explicitly with [`MountGuard::release`], and unmounted on drop if
//! the scope is left early through `?`.
//!
//! Scratch mount points are plain directories, never `TempDir`s: a recursive
//! temp-dir cleanup running after a failed unmount would delete files on the
//! card.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::command::{CommandRunner, MountArgs, UmountArgs};
use crate::disk::{DiskEnumerator, Partition};
use crate::error::{ProvisionError, Result};

/// Upper bound on `umount` calls per partition (stacked mounts)
const MAX_UNMOUNTS_PER_PARTITION: usize = 8;

/// Name prefix of the scratch directories created by [`MountGuard`]
const SCRATCH_PREFIX: &str = "dephy-pi-mnt-";

/// Mount and unmount block devices.
pub trait Mounter {
    /// Mount `partition` at the existing directory `target`.
    fn mount(&self, partition: &Partition, target: &Path) -> Result<()>;

    /// Unmount whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// [`Mounter`] backed by `mount(8)` and `umount(8)` with a bounded wait.
pub struct SystemMounter<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Option<Duration>,
}

impl<'a> SystemMounter<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeout: Option<Duration>) -> Self {
        Self { runner, timeout }
    }
}

impl Mounter for SystemMounter<'_> {
    fn mount(&self, partition: &Partition, target: &Path) -> Result<()> {
        let args = MountArgs {
            device: partition.device.clone(),
            target: target.to_path_buf(),
        };
        let output = self.runner.run(&args, self.timeout)?;
        if output.success {
            Ok(())
        } else {
            Err(ProvisionError::MountFailed {
                partition: partition.device.clone(),
                mount_point: target.to_path_buf(),
                reason: output.stderr.trim().to_string(),
            })
        }
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let args = UmountArgs {
            target: target.to_path_buf(),
        };
        self.runner.run(&args, self.timeout)?.ensure_success("umount")?;
        Ok(())
    }
}

/// A partition mounted at a private scratch directory for the guard's lifetime.
pub struct MountGuard<'a> {
    mounter: &'a dyn Mounter,
    partition: Partition,
    dir: PathBuf,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    /// Mount `partition` at a fresh scratch directory under `parent` (the
    /// system temp dir when `None`).
    pub fn mount(
        mounter: &'a dyn Mounter,
        partition: &Partition,
        parent: Option<&Path>,
    ) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(SCRATCH_PREFIX);
            b
        };
        let scratch = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        // Hand ownership of the directory to the guard; see module docs
        #[allow(deprecated)]
        let dir = scratch.into_path();

        if let Err(e) = mounter.mount(partition, &dir) {
            let _ = fs::remove_dir(&dir);
            return Err(e);
        }
        debug!(partition = %partition, dir = %dir.display(), "mounted");

        Ok(Self {
            mounter,
            partition: partition.clone(),
            dir,
            mounted: true,
        })
    }

    /// Mount point of the partition.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Unmount and remove the scratch directory.
    ///
    /// On failure the mount is left for the caller's cleanup path; drop
    /// does not retry.
    pub fn release(mut self) -> Result<()> {
        let result = self.unmount_now();
        self.mounted = false;
        result
    }

    fn unmount_now(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounter
            .unmount(&self.dir)
            .map_err(|e| ProvisionError::UnmountFailed {
                partition: self.partition.device.clone(),
                mount_point: self.dir.clone(),
                reason: e.to_string(),
            })?;
        self.mounted = false;
        debug!(partition = %self.partition, "unmounted");

        // Non-recursive on purpose
        if let Err(e) = fs::remove_dir(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "could not remove scratch mount point");
        }
        Ok(())
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self.unmount_now() {
                error!(partition = %self.partition, error = %e, "failed to unmount while unwinding");
            }
        }
    }
}

/// Unmount every partition in `partitions`, wherever it is mounted.
///
/// Idempotent: partitions that are not mounted are skipped. Returns the
/// `(partition, mount point)` pairs that were released.
pub fn unmount_partitions(
    disks: &dyn DiskEnumerator,
    mounter: &dyn Mounter,
    partitions: &[Partition],
) -> Result<Vec<(Partition, PathBuf)>> {
    let mut released = Vec::new();

    for partition in partitions {
        for _ in 0..MAX_UNMOUNTS_PER_PARTITION {
            let Some(mount_point) = disks.mount_point_of(partition)? else {
                break;
            };
            mounter
                .unmount(&mount_point)
                .map_err(|e| ProvisionError::UnmountFailed {
                    partition: partition.device.clone(),
                    mount_point: mount_point.clone(),
                    reason: e.to_string(),
                })?;
            info!(partition = %partition, mount_point = %mount_point.display(), "unmounted");
            remove_scratch_dir(&mount_point);
            released.push((partition.clone(), mount_point));
        }
    }

    ensure_unmounted(disks, partitions)?;
    Ok(released)
}

/// Remove a scratch mount point left behind by a guard whose unmount failed.
/// Other mount points are not ours to delete.
fn remove_scratch_dir(mount_point: &Path) {
    let ours = mount_point
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));
    if !ours {
        return;
    }
    // Non-recursive: a directory that still has content stays
    match fs::remove_dir(mount_point) {
        Ok(()) => debug!(dir = %mount_point.display(), "removed stale scratch mount point"),
        Err(e) => warn!(dir = %mount_point.display(), error = %e, "could not remove scratch mount point"),
    }
}

/// Fail with `UnmountFailed` if any partition is still mounted.
pub fn ensure_unmounted(disks: &dyn DiskEnumerator, partitions: &[Partition]) -> Result<()> {
    for partition in partitions {
        if let Some(mount_point) = disks.mount_point_of(partition)? {
            return Err(ProvisionError::UnmountFailed {
                partition: partition.device.clone(),
                mount_point,
                reason: "partition is still mounted".to_string(),
            });
        }
    }
    Ok(())
}
