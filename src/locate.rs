//! Partition Locator: find the flashed root and boot filesystems by marker.
//!
//! Discovery order is whatever the enumerator returned, so nothing here
//! assumes the boot partition comes first.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::disk::Partition;
use crate::error::{ProvisionError, Result};
use crate::mount::{MountGuard, Mounter};

/// Lists the top-level entries of a partition's filesystem.
pub trait PartitionInspector {
    fn top_level_entries(&self, partition: &Partition) -> Result<Vec<String>>;
}

/// Inspects a partition by mounting it at a scratch directory.
pub struct MountingInspector<'a> {
    mounter: &'a dyn Mounter,
    scratch_parent: Option<PathBuf>,
}

impl<'a> MountingInspector<'a> {
    pub fn new(mounter: &'a dyn Mounter, scratch_parent: Option<PathBuf>) -> Self {
        Self {
            mounter,
            scratch_parent,
        }
    }
}

impl PartitionInspector for MountingInspector<'_> {
    fn top_level_entries(&self, partition: &Partition) -> Result<Vec<String>> {
        let guard = MountGuard::mount(self.mounter, partition, self.scratch_parent.as_deref())?;
        let listing = list_dir(guard.path());
        guard.release()?;
        listing
    }
}

fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

/// The first partition whose top level contains `marker`.
///
/// Partitions that cannot be mounted (swap, unknown filesystems) are skipped.
pub fn locate(
    partitions: &[Partition],
    marker: &str,
    inspector: &dyn PartitionInspector,
) -> Result<Option<Partition>> {
    for partition in partitions {
        let entries = match inspector.top_level_entries(partition) {
            Ok(entries) => entries,
            Err(ProvisionError::MountFailed { reason, .. }) => {
                warn!(partition = %partition, reason = %reason, "skipping partition that cannot be mounted");
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!(partition = %partition, entries = entries.len(), marker, "inspected partition");
        if entries.iter().any(|name| name == marker) {
            info!(partition = %partition, marker, "marker found");
            return Ok(Some(partition.clone()));
        }
    }
    Ok(None)
}

/// Root and boot filesystems of a freshly flashed card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub root: Partition,
    pub boot: Partition,
}

/// Locate both filesystems, failing with `PartitionNotFound` if either is missing.
pub fn locate_layout(
    partitions: &[Partition],
    root_marker: &str,
    boot_marker: &str,
    inspector: &dyn PartitionInspector,
) -> Result<PartitionLayout> {
    let find = |marker: &str| -> Result<Partition> {
        locate(partitions, marker, inspector)?.ok_or_else(|| ProvisionError::PartitionNotFound {
            marker: marker.to_string(),
        })
    };
    let root = find(root_marker)?;
    let boot = find(boot_marker)?;
    Ok(PartitionLayout { root, boot })
}
