//! Session Orchestrator: one `create` run from drive discovery to eject.
//!
//! The run is strictly sequential. Each step ends with a validated
//! [`SessionStage`] transition, and any fatal error moves the context to
//! `Aborted` after a best-effort unmount of the card's partitions.

mod stage;

pub use stage::{SessionContext, SessionStage, TransitionError};

use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::command::{CommandRunner, EjectArgs};
use crate::config::ProvisionConfig;
use crate::configure::{FirstBootConfigurator, PasswordChange};
use crate::disk::{DiskEnumerator, Partition, RemovableDrive};
use crate::error::{ProvisionError, Result};
use crate::fetch::{ImageFetcher, ObjectStore};
use crate::flash::DeviceWriter;
use crate::locate::{MountingInspector, PartitionLayout, locate_layout};
use crate::mount::{Mounter, ensure_unmounted, unmount_partitions};
use crate::process_guard::check_interrupted;
use crate::prompt::Prompter;
use crate::ui::Reporter;

const NONE_OF_THE_ABOVE: &str = "None of the above.";

/// Host collaborators a session drives
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub disks: &'a dyn DiskEnumerator,
    pub mounter: &'a dyn Mounter,
    pub runner: &'a dyn CommandRunner,
    pub store: &'a dyn ObjectStore,
    pub prompter: &'a dyn Prompter,
}

/// What a successful run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub drive: RemovableDrive,
    pub layout: PartitionLayout,
    pub ssid: String,
    pub hostname: String,
    pub ssh_enabled: bool,
    /// `None` when the password step was skipped after repeated mismatches
    pub password: Option<PasswordChange>,
    /// Stages entered, in order
    pub stages: Vec<SessionStage>,
}

/// Pick the drive to flash.
///
/// A single drive is taken without asking. With several, the user chooses
/// one or declines them all.
pub fn select_drive(
    disks: &dyn DiskEnumerator,
    prompter: &dyn Prompter,
    reporter: &Reporter,
) -> Result<RemovableDrive> {
    let mut drives = disks.list_removable_drives()?;
    info!(count = drives.len(), "removable drives found");

    let drive = match drives.len() {
        0 => return Err(ProvisionError::DeviceNotFound),
        1 => drives.remove(0),
        n => {
            let mut options: Vec<String> = drives.iter().map(ToString::to_string).collect();
            options.push(NONE_OF_THE_ABOVE.to_string());
            let choice = prompter.select("Multiple drives found. Which is your SD card?", &options)?;
            if choice >= n {
                info!("user declined every drive");
                return Err(ProvisionError::DeviceNotFound);
            }
            drives.swap_remove(choice)
        }
    };

    reporter.detail("Found sd card at:", &drive.device.display().to_string());
    Ok(drive)
}

pub struct Session<'a> {
    host: Host<'a>,
    config: &'a ProvisionConfig,
    reporter: Reporter,
    scratch_dir: Option<PathBuf>,
    ctx: SessionContext,
    partitions: Vec<Partition>,
}

impl<'a> Session<'a> {
    pub fn new(host: Host<'a>, config: &'a ProvisionConfig, reporter: Reporter) -> Self {
        Self {
            host,
            config,
            reporter,
            scratch_dir: None,
            ctx: SessionContext::new(),
            partitions: Vec::new(),
        }
    }

    /// Create scratch mount points under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Run every step. On failure the session is aborted and the card's
    /// partitions are released before the error is returned.
    pub fn run(&mut self) -> Result<SessionReport> {
        match self.execute() {
            Ok(report) => Ok(report),
            Err(err) => {
                self.abort(&err);
                Err(err)
            }
        }
    }

    fn execute(&mut self) -> Result<SessionReport> {
        let Host {
            disks,
            mounter,
            runner,
            store,
            prompter,
        } = self.host;
        let config = self.config;

        // Drive selection and erase confirmation
        self.reporter.step("Finding SD card...");
        let drive = select_drive(disks, prompter, &self.reporter)?;
        if !prompter.confirm(
            &format!("All data on {} will be erased. Continue?", drive),
            false,
        )? {
            info!(device = %drive.device.display(), "erase declined");
            return Err(ProvisionError::DeviceNotFound);
        }
        self.ctx.confirm_destructive_operations();
        self.ctx.transition_to(SessionStage::DriveSelected)?;
        check_interrupted()?;

        self.reporter.step("Unmounting partitions...");
        self.partitions = disks.list_partitions(&drive)?;
        self.release_partitions()?;
        self.ctx.transition_to(SessionStage::PartitionsUnmounted)?;
        check_interrupted()?;

        self.reporter.step("Downloading image...");
        let fetcher = ImageFetcher::new(store, config.download_dir.clone());
        let bar = self.reporter.download_bar();
        let image = fetcher
            .fetch(&config.bucket, &config.object, &mut |event| bar.observe(event))
            .inspect_err(|_| bar.abandon())?;
        bar.finish();
        self.reporter.detail("Downloaded:", &format!("{} bytes", image.size()));
        self.ctx.transition_to(SessionStage::ImageDownloaded)?;
        check_interrupted()?;

        // Automounters may have grabbed a partition during the download
        self.release_partitions()?;
        ensure_unmounted(disks, &self.partitions)?;

        self.reporter.step("Flashing image...");
        let writer = DeviceWriter::new(runner, config.block_size.as_str());
        let spinner = self.reporter.flash_spinner(&drive.device.display().to_string());
        writer
            .write(&image, &drive, &mut || spinner.tick())
            .inspect_err(|_| spinner.abandon())?;
        spinner.finish();
        drop(image);
        self.ctx.transition_to(SessionStage::Flashed)?;
        check_interrupted()?;

        if writer.reread_partition_table(&drive) {
            match disks.list_partitions(&drive) {
                Ok(fresh) if !fresh.is_empty() => self.partitions = fresh,
                Ok(_) => warn!(device = %drive.device.display(), "no partitions after re-read"),
                Err(e) => warn!(error = %e, "re-enumerating partitions failed"),
            }
        }
        self.release_partitions()?;

        self.reporter.step("Locating partitions...");
        let inspector = MountingInspector::new(mounter, self.scratch_dir.clone());
        let layout = locate_layout(
            &self.partitions,
            &config.root_marker,
            &config.boot_marker,
            &inspector,
        )?;
        self.reporter.detail("Root filesystem:", &layout.root.to_string());
        self.reporter.detail("Boot filesystem:", &layout.boot.to_string());
        self.ctx.transition_to(SessionStage::PartitionsLocated)?;
        check_interrupted()?;

        let mut configurator = FirstBootConfigurator::new(mounter, runner, prompter, self.reporter);
        if let Some(dir) = &self.scratch_dir {
            configurator = configurator.with_scratch_dir(dir.clone());
        }

        self.reporter.step("Configuring WiFi...");
        let ssid = configurator.setup_wifi(&layout.root)?;
        self.ctx.transition_to(SessionStage::WifiConfigured)?;
        check_interrupted()?;

        self.reporter.step("Setting hostname...");
        let hostname = configurator.setup_hostname(&layout.root)?;
        self.ctx.transition_to(SessionStage::HostnameConfigured)?;
        check_interrupted()?;

        if config.enable_ssh {
            self.reporter.step("Enabling SSH...");
            configurator.enable_ssh(&layout.boot)?;
            self.ctx.transition_to(SessionStage::SshEnabled)?;
            check_interrupted()?;
        }

        self.reporter.step("Changing password...");
        let password = match configurator.change_password(
            &layout.root,
            &config.password_user,
            config.password_attempts,
        ) {
            Ok(change) => Some(change),
            Err(ProvisionError::CredentialMismatch { attempts }) => {
                warn!(attempts, "password step skipped after repeated mismatches");
                self.reporter
                    .warn("Skipping password change; the default account stays locked.");
                None
            }
            Err(e) => return Err(e),
        };
        if password == Some(PasswordChange::Changed) {
            self.ctx.transition_to(SessionStage::RootPasswordChanged)?;
        }
        check_interrupted()?;

        self.reporter.step("Ejecting SD card...");
        ensure_unmounted(disks, &self.partitions)?;
        runner
            .run(
                &EjectArgs {
                    device: drive.device.clone(),
                },
                config.mount_timeout(),
            )?
            .ensure_success("eject")?;
        self.ctx.transition_to(SessionStage::Ejected)?;

        self.ctx.advance()?;
        self.reporter.success("Done!");
        info!(device = %drive.device.display(), hostname = %hostname, "session complete");

        Ok(SessionReport {
            drive,
            layout,
            ssid,
            hostname,
            ssh_enabled: config.enable_ssh,
            password,
            stages: self.ctx.history().iter().map(|(stage, _)| *stage).collect(),
        })
    }

    fn release_partitions(&self) -> Result<()> {
        for (partition, mount_point) in
            unmount_partitions(self.host.disks, self.host.mounter, &self.partitions)?
        {
            self.reporter.detail(
                "Unmounted",
                &format!("`{}` from `{}`", partition, mount_point.display()),
            );
        }
        Ok(())
    }

    fn abort(&mut self, err: &ProvisionError) {
        let stage = self.ctx.current_stage();
        if let Err(e) = self.ctx.abort() {
            warn!(error = %e, "session already terminal");
        }
        error!(stage = %stage, error = %err, "session aborted");

        if self.partitions.is_empty() {
            return;
        }
        if let Err(e) = unmount_partitions(self.host.disks, self.host.mounter, &self.partitions) {
            error!(error = %e, "cleanup left a partition mounted");
            self.reporter.warn(&format!("Cleanup incomplete: {}", e));
        }
    }
}
