use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ProvisionConfig;

/// dephy-pi - Flash and pre-configure a Raspberry Pi SD card
#[derive(Parser, Debug)]
#[command(name = "dephy-pi")]
#[command(about = "Flash a Raspberry Pi image onto an SD card and set up first boot")]
#[command(version)]
pub struct Cli {
    /// Verbose diagnostics on stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress progress output; errors are still shown
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download the image, flash the SD card and configure first boot
    Create(CreateArgs),
    /// Validate a configuration file and exit
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

/// Overrides for values from the configuration file
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
pub struct CreateArgs {
    /// Bucket holding the image
    #[arg(long)]
    pub bucket: Option<String>,

    /// Object key of the image
    #[arg(long)]
    pub object: Option<String>,

    /// Bucket region
    #[arg(long)]
    pub region: Option<String>,

    /// Bound on each mount/umount in seconds (0 waits forever)
    #[arg(long, value_name = "SECS")]
    pub mount_timeout: Option<u64>,

    /// Do not create the SSH marker on the boot partition
    #[arg(long)]
    pub no_ssh: bool,
}

impl CreateArgs {
    /// Apply the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut ProvisionConfig) {
        if let Some(bucket) = &self.bucket {
            config.bucket = bucket.clone();
        }
        if let Some(object) = &self.object {
            config.object = object.clone();
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(secs) = self.mount_timeout {
            config.mount_timeout_secs = secs;
        }
        if self.no_ssh {
            config.enable_ssh = false;
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
