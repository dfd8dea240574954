//! First-Boot Configurator.
//!
//! Each edit gathers its input first, then mounts the target partition at a
//! scratch directory, edits files, and unmounts. The unmount runs on every
//! exit path; an edit error takes precedence over an unmount error.

pub mod hostname;
pub mod password;
pub mod ssh;
pub mod wifi;

use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::command::CommandRunner;
use crate::disk::Partition;
use crate::error::Result;
use crate::mount::{MountGuard, Mounter};
use crate::prompt::Prompter;
use crate::ui::Reporter;

use self::wifi::NetworkCredential;

/// Outcome of the optional password step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordChange {
    Changed,
    /// The user chose not to set one
    Declined,
    /// The shadow file had no locked entry for the account
    NoLockedEntry,
}

pub struct FirstBootConfigurator<'a> {
    mounter: &'a dyn Mounter,
    runner: &'a dyn CommandRunner,
    prompter: &'a dyn Prompter,
    reporter: Reporter,
    scratch_parent: Option<PathBuf>,
}

impl<'a> FirstBootConfigurator<'a> {
    pub fn new(
        mounter: &'a dyn Mounter,
        runner: &'a dyn CommandRunner,
        prompter: &'a dyn Prompter,
        reporter: Reporter,
    ) -> Self {
        Self {
            mounter,
            runner,
            prompter,
            reporter,
            scratch_parent: None,
        }
    }

    /// Create scratch mount points under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(dir.into());
        self
    }

    /// Run `edit` against `partition` mounted at a scratch directory.
    pub fn with_mount<T>(
        &self,
        partition: &Partition,
        edit: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let guard = MountGuard::mount(self.mounter, partition, self.scratch_parent.as_deref())?;
        let edited = edit(guard.path());
        let released = guard.release();

        match (edited, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(unmount)) => Err(unmount),
            (Err(edit), Ok(())) => Err(edit),
            (Err(edit), Err(unmount)) => {
                error!(partition = %partition, error = %unmount, "unmount failed after edit error");
                Err(edit)
            }
        }
    }

    /// Prompt for network details and append a supplicant stanza on `root`.
    pub fn setup_wifi(&self, root: &Partition) -> Result<String> {
        let ssid = self
            .prompter
            .text("Enter the WiFi network to connect your Pi to:", Some(wifi::validate_ssid))?;
        let psk = self
            .prompter
            .secret("Enter the network's password:", Some(wifi::validate_psk))?;
        let credential = NetworkCredential { ssid, psk };

        let stanza = wifi::derive_stanza(self.runner, &credential)?;
        self.with_mount(root, |dir| wifi::append_stanza(&dir.join(wifi::SUPPLICANT_CONF), &stanza))?;

        info!(ssid = %credential.ssid, "wifi configured");
        self.reporter.detail("WiFi network:", &credential.ssid);
        Ok(credential.ssid)
    }

    /// Prompt for a hostname and apply it on `root`.
    pub fn setup_hostname(&self, root: &Partition) -> Result<String> {
        let name = self
            .prompter
            .text("Enter a hostname for your pi:", Some(hostname::validate_hostname))?;
        self.with_mount(root, |dir| hostname::apply(dir, &name))?;

        info!(hostname = %name, "hostname configured");
        self.reporter.detail("Hostname:", &name);
        Ok(name)
    }

    /// Drop the SSH marker on `boot`.
    pub fn enable_ssh(&self, boot: &Partition) -> Result<()> {
        let created = self.with_mount(boot, ssh::enable)?;
        info!(created, "ssh enabled");
        self.reporter.detail("SSH:", "enabled on first boot");
        Ok(())
    }

    /// Optionally set a password for `user` on `root`.
    ///
    /// Fails with `CredentialMismatch` before anything is mounted if the
    /// entries never match.
    pub fn change_password(&self, root: &Partition, user: &str, attempts: u32) -> Result<PasswordChange> {
        if !self
            .prompter
            .confirm(&format!("Set a new password for `{}`?", user), true)?
        {
            return Ok(PasswordChange::Declined);
        }

        let hash = password::prompt_matching_password(self.prompter, &self.reporter, user, attempts)?;
        let changed = self.with_mount(root, |dir| {
            password::install_password_hash(&dir.join(password::SHADOW_FILE), user, &hash)
        })?;

        if changed {
            self.reporter.detail("Password:", &format!("updated for `{}`", user));
            Ok(PasswordChange::Changed)
        } else {
            self.reporter
                .warn(&format!("`{}` has no locked shadow entry; password left unchanged", user));
            Ok(PasswordChange::NoLockedEntry)
        }
    }
}
