//! Disk enumeration: removable drives, their partitions, and live mount state.
//!
//! Discovery reads sysfs (`/sys/block/<disk>/removable`, partition
//! subdirectories) and the kernel mount table (`/proc/self/mounts`). All
//! three roots are injectable so the enumerator can run against a fake tree.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// A hot-pluggable block device, e.g. an SD card behind a USB reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovableDrive {
    /// Kernel name (`sdb`, `mmcblk0`)
    pub name: String,
    /// Device node (`/dev/sdb`)
    pub device: PathBuf,
    pub model: Option<String>,
    pub size_bytes: u64,
}

impl fmt::Display for RemovableDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device.display())?;
        match &self.model {
            Some(model) => write!(f, " ({}, {})", model, human_size(self.size_bytes)),
            None => write!(f, " ({})", human_size(self.size_bytes)),
        }
    }
}

/// A partition of a [`RemovableDrive`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    /// Device node (`/dev/sdb1`)
    pub device: PathBuf,
    /// Device node of the parent drive, for lookup only
    pub drive: PathBuf,
    /// Partition number from sysfs
    pub number: u32,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device.display())
    }
}

/// Host disk discovery.
pub trait DiskEnumerator {
    /// All removable drives with media present.
    fn list_removable_drives(&self) -> Result<Vec<RemovableDrive>>;

    /// Partitions of `drive`, ordered by partition number.
    fn list_partitions(&self, drive: &RemovableDrive) -> Result<Vec<Partition>>;

    /// Where `partition` is currently mounted, if anywhere.
    fn mount_point_of(&self, partition: &Partition) -> Result<Option<PathBuf>>;
}

/// [`DiskEnumerator`] over sysfs and the kernel mount table.
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    sys_block: PathBuf,
    dev_dir: PathBuf,
    mount_table: PathBuf,
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsEnumerator {
    pub fn new() -> Self {
        Self::with_roots("/sys/block", "/dev", "/proc/self/mounts")
    }

    pub fn with_roots(
        sys_block: impl Into<PathBuf>,
        dev_dir: impl Into<PathBuf>,
        mount_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_dir: dev_dir.into(),
            mount_table: mount_table.into(),
        }
    }
}

impl DiskEnumerator for SysfsEnumerator {
    fn list_removable_drives(&self) -> Result<Vec<RemovableDrive>> {
        ensure_linux()?;

        let mut drives = Vec::new();
        for entry in fs::read_dir(&self.sys_block)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            if read_trimmed(&path.join("removable")).as_deref() != Some("1") {
                continue;
            }
            let size_bytes = read_trimmed(&path.join("size"))
                .and_then(|s| s.parse::<u64>().ok())
                .map(|sectors| sectors.saturating_mul(512))
                .unwrap_or(0);
            if size_bytes == 0 {
                // Card reader slot without a card
                debug!(disk = %name, "skipping removable drive with no media");
                continue;
            }

            drives.push(RemovableDrive {
                device: self.dev_dir.join(&name),
                model: read_trimmed(&path.join("device/model")).filter(|m| !m.is_empty()),
                name,
                size_bytes,
            });
        }

        drives.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = drives.len(), "removable drives found");
        Ok(drives)
    }

    fn list_partitions(&self, drive: &RemovableDrive) -> Result<Vec<Partition>> {
        ensure_linux()?;

        let mut partitions = Vec::new();
        for entry in fs::read_dir(self.sys_block.join(&drive.name))? {
            let entry = entry?;
            let Some(number) = read_trimmed(&entry.path().join("partition"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            partitions.push(Partition {
                device: self.dev_dir.join(entry.file_name()),
                drive: drive.device.clone(),
                number,
            });
        }

        partitions.sort_by_key(|p| p.number);
        debug!(drive = %drive.device.display(), count = partitions.len(), "partitions listed");
        Ok(partitions)
    }

    fn mount_point_of(&self, partition: &Partition) -> Result<Option<PathBuf>> {
        let table = fs::read_to_string(&self.mount_table)?;
        Ok(find_mount_point(&parse_mount_table(&table), &partition.device))
    }
}

/// One line of `/proc/self/mounts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Parse a `/proc/mounts`-format table. Malformed lines are skipped.
pub fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: PathBuf::from(unescape_mount_field(device)),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// First mount point whose device field names `device`.
pub fn find_mount_point(entries: &[MountEntry], device: &Path) -> Option<PathBuf> {
    let canonical = fs::canonicalize(device).ok();
    entries
        .iter()
        .find(|entry| {
            entry.device == device
                || (canonical.is_some() && fs::canonicalize(&entry.device).ok() == canonical)
        })
        .map(|entry| entry.mount_point.clone())
}

/// The kernel escapes space, tab, newline and backslash as `\ooo` octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn ensure_linux() -> Result<()> {
    if cfg!(target_os = "linux") {
        Ok(())
    } else {
        Err(ProvisionError::PlatformUnsupported {
            os: std::env::consts::OS.to_string(),
        })
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
