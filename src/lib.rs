//! dephy-pi Library
//!
//! Downloads a Raspberry Pi OS image, flashes it onto a removable SD card and
//! applies first-boot customizations (WiFi, hostname, SSH, password) to the
//! flashed filesystems.

pub mod cli;
pub mod command;
pub mod config;
pub mod configure;
pub mod disk;
pub mod error;
pub mod fetch;
pub mod flash;
pub mod locate;
pub mod mount;
pub mod process_guard;
pub mod progress;
pub mod prompt;
pub mod sanity;
pub mod session;
pub mod ui;

// Re-export main types for convenience
pub use command::{CommandArgs, CommandOutput, CommandRunner, SystemRunner};
pub use config::{AwsCredentials, ProvisionConfig};
pub use configure::{FirstBootConfigurator, PasswordChange};
pub use disk::{DiskEnumerator, Partition, RemovableDrive, SysfsEnumerator};
pub use error::{ProvisionError, Result};
pub use fetch::{ImageFetcher, ObjectStore, S3Store};
pub use locate::{PartitionLayout, locate, locate_layout};
pub use mount::{MountGuard, Mounter, SystemMounter, ensure_unmounted, unmount_partitions};
pub use process_guard::{ChildRegistry, CommandProcessGroup, NonInterruptible};
pub use prompt::{InquirePrompter, Prompter};
pub use session::{Host, Session, SessionContext, SessionReport, SessionStage, select_drive};
