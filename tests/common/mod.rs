//! In-memory host for driving a whole session without touching real devices.
//!
//! Each partition of the fake card is a directory under a temp tree. Mounting
//! copies that directory into the scratch mount point and unmounting copies it
//! back, so edits made through a mount land on the "card".

#![allow(dead_code)]

mod prompter;

pub use prompter::{Answer, ScriptedPrompter};

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use dephy_pi::command::{CommandArgs, CommandOutput, CommandRunner};
use dephy_pi::config::ProvisionConfig;
use dephy_pi::disk::{DiskEnumerator, Partition, RemovableDrive};
use dephy_pi::error::{ProvisionError, Result};
use dephy_pi::fetch::ObjectStore;
use dephy_pi::mount::Mounter;
use dephy_pi::session::Host;

pub const IMAGE: &[u8] = b"raspberry pi os lite image bytes";
pub const DERIVED_PSK: &str = "0b8d3a5b3e1a9c6f4e2d7c8b9a0f1e2d3c4b5a6978877665544332211000aabb";

pub const HOSTS: &str = "127.0.0.1\tlocalhost\n\
                         ::1\t\tlocalhost ip6-localhost ip6-loopback\n\
                         127.0.1.1\traspberrypi\n";
pub const SHADOW: &str = "root:*:19000:0:99999:7:::\n\
                          daemon:*:19000:0:99999:7:::\n\
                          pi:*:19000:0:99999:7:::\n";
pub const SUPPLICANT: &str = "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\n\
                              update_config=1\n";

/// Which partition number holds which filesystem after flashing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    BootFirst,
    RootFirst,
}

struct MountEntry {
    device: PathBuf,
    target: PathBuf,
    /// Backing partition directory; `None` for a pre-existing automount
    backing: Option<u32>,
}

pub struct FakeHost {
    tree: TempDir,
    drives: Vec<RemovableDrive>,
    partition_count: u32,
    layout: ImageLayout,
    mounts: RefCell<Vec<MountEntry>>,
    busy: RefCell<HashSet<PathBuf>>,
    unmountable: HashSet<u32>,
    commands: RefCell<Vec<String>>,
    flashed: RefCell<bool>,
    pub store: MemoryStore,
}

impl FakeHost {
    /// One 32 GB card at `/dev/sdb` with two partitions.
    pub fn new() -> Self {
        Self::with_drives(1)
    }

    pub fn with_drives(count: usize) -> Self {
        let tree = tempfile::tempdir().expect("tempdir");
        fs::create_dir(tree.path().join("scratch")).expect("scratch dir");
        let drives = (0..count)
            .map(|i| {
                let name = format!("sd{}", (b'b' + i as u8) as char);
                RemovableDrive {
                    device: PathBuf::from(format!("/dev/{}", name)),
                    name,
                    model: Some("SD/MMC".to_string()),
                    size_bytes: 32 * 1024 * 1024 * 1024,
                }
            })
            .collect();

        let host = Self {
            tree,
            drives,
            partition_count: 2,
            layout: ImageLayout::BootFirst,
            mounts: RefCell::new(Vec::new()),
            busy: RefCell::new(HashSet::new()),
            unmountable: HashSet::new(),
            commands: RefCell::new(Vec::new()),
            flashed: RefCell::new(false),
            store: MemoryStore::new(IMAGE),
        };
        for n in 1..=host.partition_count {
            let dir = host.partition_dir(n);
            fs::create_dir_all(&dir).expect("partition dir");
            fs::write(dir.join("old-card-contents.txt"), "before flash").expect("old file");
        }
        host
    }

    pub fn with_store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_layout(mut self, layout: ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// A third partition with no filesystem the fake can mount.
    pub fn with_swap_partition(mut self) -> Self {
        self.partition_count = 3;
        self.unmountable.insert(3);
        fs::create_dir_all(self.partition_dir(3)).expect("swap dir");
        self
    }

    /// Pretend a desktop automounter holds `number` at `mount_point`.
    pub fn automount(&self, number: u32, mount_point: &str) {
        self.mounts.borrow_mut().push(MountEntry {
            device: self.partition_device(number),
            target: PathBuf::from(mount_point),
            backing: None,
        });
    }

    /// Make unmounting `mount_point` fail with "target is busy".
    pub fn make_busy(&self, mount_point: &str) {
        self.busy.borrow_mut().insert(PathBuf::from(mount_point));
    }

    pub fn host<'a>(&'a self, prompter: &'a ScriptedPrompter) -> Host<'a> {
        Host {
            disks: self,
            mounter: self,
            runner: self,
            store: &self.store,
            prompter,
        }
    }

    pub fn scratch(&self) -> PathBuf {
        self.tree.path().join("scratch")
    }

    pub fn config(&self) -> ProvisionConfig {
        ProvisionConfig {
            download_dir: Some(self.tree.path().to_path_buf()),
            ..Default::default()
        }
    }

    pub fn partition_device(&self, number: u32) -> PathBuf {
        PathBuf::from(format!("/dev/sdb{}", number))
    }

    pub fn partition_dir(&self, number: u32) -> PathBuf {
        self.tree.path().join("card").join(format!("p{}", number))
    }

    pub fn boot_dir(&self) -> PathBuf {
        match self.layout {
            ImageLayout::BootFirst => self.partition_dir(1),
            ImageLayout::RootFirst => self.partition_dir(2),
        }
    }

    pub fn root_dir(&self) -> PathBuf {
        match self.layout {
            ImageLayout::BootFirst => self.partition_dir(2),
            ImageLayout::RootFirst => self.partition_dir(1),
        }
    }

    pub fn read_root(&self, relative: &str) -> String {
        fs::read_to_string(self.root_dir().join(relative)).expect("read root file")
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| c.split_whitespace().next().map(str::to_string))
            .collect()
    }

    pub fn was_flashed(&self) -> bool {
        *self.flashed.borrow()
    }

    pub fn mounted(&self) -> Vec<(PathBuf, PathBuf)> {
        self.mounts
            .borrow()
            .iter()
            .map(|m| (m.device.clone(), m.target.clone()))
            .collect()
    }

    /// Scratch mount points left behind
    pub fn leftover_scratch_dirs(&self) -> usize {
        fs::read_dir(self.scratch()).expect("read scratch").count()
    }

    fn flash_image(&self) {
        for n in 1..=self.partition_count {
            let dir = self.partition_dir(n);
            fs::remove_dir_all(&dir).expect("wipe partition");
            fs::create_dir_all(&dir).expect("recreate partition");
        }

        let boot = self.boot_dir();
        fs::write(boot.join("cmdline.txt"), "console=serial0,115200 root=PARTUUID=abc-02\n")
            .expect("cmdline");
        fs::write(boot.join("config.txt"), "dtparam=audio=on\n").expect("config.txt");

        let root = self.root_dir();
        for dir in ["root", "etc/wpa_supplicant", "boot", "home/pi"] {
            fs::create_dir_all(root.join(dir)).expect("root dirs");
        }
        fs::write(root.join("etc/hostname"), "raspberrypi\n").expect("hostname");
        fs::write(root.join("etc/hosts"), HOSTS).expect("hosts");
        fs::write(root.join("etc/shadow"), SHADOW).expect("shadow");
        fs::write(root.join("etc/wpa_supplicant/wpa_supplicant.conf"), SUPPLICANT)
            .expect("supplicant");

        *self.flashed.borrow_mut() = true;
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&dest)?;
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

impl DiskEnumerator for FakeHost {
    fn list_removable_drives(&self) -> Result<Vec<RemovableDrive>> {
        Ok(self.drives.clone())
    }

    fn list_partitions(&self, drive: &RemovableDrive) -> Result<Vec<Partition>> {
        Ok((1..=self.partition_count)
            .map(|number| Partition {
                device: PathBuf::from(format!("{}{}", drive.device.display(), number)),
                drive: drive.device.clone(),
                number,
            })
            .collect())
    }

    fn mount_point_of(&self, partition: &Partition) -> Result<Option<PathBuf>> {
        Ok(self
            .mounts
            .borrow()
            .iter()
            .find(|m| m.device == partition.device)
            .map(|m| m.target.clone()))
    }
}

impl Mounter for FakeHost {
    fn mount(&self, partition: &Partition, target: &Path) -> Result<()> {
        if self.unmountable.contains(&partition.number) {
            return Err(ProvisionError::MountFailed {
                partition: partition.device.clone(),
                mount_point: target.to_path_buf(),
                reason: "wrong fs type, bad option, bad superblock".to_string(),
            });
        }
        copy_tree(&self.partition_dir(partition.number), target)?;
        self.mounts.borrow_mut().push(MountEntry {
            device: partition.device.clone(),
            target: target.to_path_buf(),
            backing: Some(partition.number),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        if self.busy.borrow().contains(target) {
            return Err(ProvisionError::CommandFailed {
                program: "umount".to_string(),
                code: 32,
                stderr: format!("umount: {}: target is busy.", target.display()),
            });
        }
        let mut mounts = self.mounts.borrow_mut();
        let index = mounts
            .iter()
            .position(|m| m.target == target)
            .ok_or_else(|| ProvisionError::CommandFailed {
                program: "umount".to_string(),
                code: 32,
                stderr: format!("umount: {}: not mounted.", target.display()),
            })?;
        let entry = mounts.remove(index);

        if let Some(number) = entry.backing {
            let backing = self.partition_dir(number);
            clear_dir(&backing)?;
            copy_tree(target, &backing)?;
            clear_dir(target)?;
        }
        Ok(())
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, args: &dyn CommandArgs, _timeout: Option<Duration>) -> Result<CommandOutput> {
        let mut line = args.program().to_string();
        for arg in args.to_cli_args() {
            line.push(' ');
            line.push_str(&arg);
        }
        self.commands.borrow_mut().push(line);

        match args.program() {
            "dd" => {
                if !self.mounts.borrow().is_empty() {
                    return Ok(CommandOutput::failed(1, "dd: device is busy"));
                }
                self.flash_image();
                Ok(CommandOutput::ok(""))
            }
            "wpa_passphrase" => {
                let ssid = args.to_cli_args().join(" ");
                let passphrase = args.stdin_data().unwrap_or_default();
                Ok(CommandOutput::ok(format!(
                    "# reading passphrase from stdin\nnetwork={{\n\tssid=\"{}\"\n\t#psk=\"{}\"\n\tpsk={}\n}}\n",
                    ssid,
                    passphrase.trim_end(),
                    DERIVED_PSK
                )))
            }
            "blockdev" | "eject" => Ok(CommandOutput::ok("")),
            other => Ok(CommandOutput::failed(127, format!("{}: not expected", other))),
        }
    }
}

/// Single-bucket object store holding the image
pub struct MemoryStore {
    objects: HashMap<String, Vec<u8>>,
    fail_with: Option<String>,
}

impl MemoryStore {
    pub fn new(image: &[u8]) -> Self {
        Self {
            objects: [("mypi.iso".to_string(), image.to_vec())].into(),
            fail_with: None,
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            objects: HashMap::new(),
            fail_with: Some(reason.to_string()),
        }
    }

    fn object(&self, bucket: &str, key: &str) -> Result<&Vec<u8>> {
        let not_found = |reason: String| ProvisionError::FetchFailed {
            bucket: bucket.to_string(),
            object: key.to_string(),
            reason,
        };
        if let Some(reason) = &self.fail_with {
            return Err(not_found(reason.clone()));
        }
        self.objects
            .get(key)
            .ok_or_else(|| not_found("404 Not Found".to_string()))
    }
}

impl ObjectStore for MemoryStore {
    fn content_length(&self, bucket: &str, key: &str) -> Result<u64> {
        Ok(self.object(bucket, key)?.len() as u64)
    }

    fn download(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        let data = self.object(bucket, key)?;
        for chunk in data.chunks(8) {
            sink.write_all(chunk)?;
            progress(chunk.len() as u64);
        }
        Ok(data.len() as u64)
    }
}

/// Answers for a run that accepts every default and sets a password.
pub fn happy_path_answers() -> Vec<Answer> {
    vec![
        Answer::Confirm(true),
        Answer::text("HomeNet"),
        Answer::text("correct horse battery"),
        Answer::text("mypi"),
        Answer::Confirm(true),
        Answer::text("raspberry"),
        Answer::text("raspberry"),
    ]
}
