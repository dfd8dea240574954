//! Error handling module for dephy-pi
//!
//! Provides the typed failure taxonomy of a provisioning run. Every fatal
//! condition the orchestrator can hit is a variant here, and every variant
//! knows the process exit code it maps to.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for a provisioning run
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Host is not Linux
    #[error("dephy-pi only runs on Linux (detected: {os})")]
    PlatformUnsupported { os: String },

    /// Host is missing root privileges or required binaries
    #[error("Pre-flight check failed:\n  {}", failures.join("\n  "))]
    PreflightFailed { failures: Vec<String> },

    /// No removable drive found, or the user declined every candidate
    #[error("Unable to find a valid SD card for flashing")]
    DeviceNotFound,

    /// A partition could not be released before flashing
    #[error("Failed to unmount partition `{}` from mount point `{}`: {reason}", partition.display(), mount_point.display())]
    UnmountFailed {
        partition: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },

    /// A partition could not be mounted for inspection or editing
    #[error("Failed to mount `{}` at `{}`: {reason}", partition.display(), mount_point.display())]
    MountFailed {
        partition: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },

    /// Network, auth or storage failure while downloading the image
    #[error("Failed to fetch s3://{bucket}/{object}: {reason}")]
    FetchFailed {
        bucket: String,
        object: String,
        reason: String,
    },

    /// Writing the image to the device failed
    #[error("Failed to flash `{}`: {reason}", device.display())]
    FlashFailed { device: PathBuf, reason: String },

    /// Root or boot marker not found among the flashed partitions
    #[error("No partition containing `{marker}` was found; the image may be corrupt")]
    PartitionNotFound { marker: String },

    /// Password confirmation loop exhausted
    #[error("Passwords did not match after {attempts} attempts")]
    CredentialMismatch { attempts: u32 },

    /// A privileged file edit was refused
    #[error("Permission denied while editing `{}`", path.display())]
    PermissionDenied { path: PathBuf },

    /// An external command exited unsuccessfully
    #[error("`{program}` failed (exit code {code}): {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    /// An external command exceeded its bounded wait
    #[error("`{program}` did not finish within {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    /// A termination signal arrived during the run
    #[error("Interrupted by signal")]
    Interrupted,

    /// Prompt cancelled or the terminal could not be read
    #[error("Prompt failed: {0}")]
    Prompt(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session stage machine rejected a transition
    #[error("Session transition error: {0}")]
    Transition(String),

    /// IO errors not attributable to a specific edited file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 130,
            _ => 1,
        }
    }

    /// Wrap an IO error raised while editing `path`.
    ///
    /// Permission problems become `PermissionDenied`; anything else stays an
    /// IO error.
    pub fn from_edit(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied { path: path.into() }
        } else {
            Self::Io(err)
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a prompt error
    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }
}

impl From<inquire::InquireError> for ProvisionError {
    fn from(err: inquire::InquireError) -> Self {
        match err {
            inquire::InquireError::OperationInterrupted => Self::Interrupted,
            other => Self::Prompt(other.to_string()),
        }
    }
}
