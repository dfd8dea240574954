//! Pre-flight sanity checks for the runtime environment
//!
//! Verified before any device is touched:
//! - The host is Linux
//! - Running with root privileges (EUID 0)
//! - Required runtime binaries are present
//!
//! Root and binary failures are reported together so one run shows
//! everything that needs fixing.

use crate::error::{ProvisionError, Result};
use crate::process_guard::CommandProcessGroup;
use std::process::Command;
use tracing::{debug, info, warn};

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

/// Required runtime binaries for a `create` run
const REQUIRED_BINARIES: &[&str] = &[
    "mount",          // Partition inspection and edits (util-linux)
    "umount",         // Releasing partitions (util-linux)
    "dd",             // Raw image copy (coreutils)
    "eject",          // Final release of the card
    "wpa_passphrase", // Supplicant stanza derivation (wpasupplicant)
    "blockdev",       // Partition table re-read (util-linux)
];

/// Fail with `PlatformUnsupported` unless `os` is Linux.
pub fn check_platform(os: &str) -> Result<()> {
    if os == "linux" {
        Ok(())
    } else {
        Err(ProvisionError::PlatformUnsupported { os: os.to_string() })
    }
}

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Perform the root and binary checks
pub fn verify_environment() -> SanityCheckResult {
    let missing = REQUIRED_BINARIES
        .iter()
        .filter(|binary| !binary_exists(binary))
        .map(|binary| (*binary).to_string())
        .collect();

    SanityCheckResult {
        missing_binaries: missing,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to the Debian/Raspberry Pi OS packages providing them
fn get_package_for_binary(binary: &str) -> &'static str {
    match binary {
        "mount" | "umount" => "mount",
        "blockdev" => "util-linux",
        "dd" => "coreutils",
        "eject" => "eject",
        "wpa_passphrase" => "wpasupplicant",
        _ => "unknown",
    }
}

/// Human-readable failure lines for `result`
pub fn describe_failures(result: &SanityCheckResult) -> Vec<String> {
    let mut lines = Vec::new();

    if !result.is_root {
        lines.push("Root privileges required to unmount, flash and edit the card".to_string());
        lines.push("  Solution: sudo dephy-pi create".to_string());
    }

    if !result.missing_binaries.is_empty() {
        for binary in &result.missing_binaries {
            lines.push(format!(
                "Missing required binary: {} (install: apt install {})",
                binary,
                get_package_for_binary(binary)
            ));
        }
        let mut packages: Vec<&str> = result
            .missing_binaries
            .iter()
            .map(|b| get_package_for_binary(b))
            .collect();
        packages.dedup();
        lines.push(format!("  Solution: apt install {}", packages.join(" ")));
    }

    lines
}

/// Turn a failed verification into `PreflightFailed`
pub fn check_result(result: &SanityCheckResult) -> Result<()> {
    if result.is_ok() {
        Ok(())
    } else {
        Err(ProvisionError::PreflightFailed {
            failures: describe_failures(result),
        })
    }
}

/// Skip root check (for development against fake devices)
/// Set DEPHY_PI_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var("DEPHY_PI_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Main entry point: verify the host before any device is touched.
///
/// Every failure is returned as an error so the caller reports it like any
/// other fatal condition.
pub fn run_preflight_checks() -> Result<()> {
    debug!("Running pre-flight sanity checks...");
    check_platform(std::env::consts::OS)?;

    let mut result = verify_environment();
    if should_skip_root_check() {
        warn!("Root check skipped (DEPHY_PI_SKIP_ROOT_CHECK=1)");
        result.is_root = true;
    }

    check_result(&result)?;

    info!(root = result.is_root, "pre-flight checks passed");
    Ok(())
}
