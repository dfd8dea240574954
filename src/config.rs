//! Configuration for a provisioning run.
//!
//! Every field has a default, so running without a config file is the normal
//! case. A JSON file can override defaults and CLI flags override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BUCKET: &str = "dephy-public-binaries";
pub const DEFAULT_OBJECT: &str = "mypi.iso";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Settings for one `create` run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    // Image source
    pub bucket: String,
    pub object: String,
    pub region: String,
    /// Base URL of an S3-compatible endpoint; AWS virtual-hosted style when unset
    pub endpoint: Option<String>,
    /// Require credentials instead of falling back to an anonymous request
    pub protected: bool,
    /// Directory for the temporary image file (system temp dir when unset)
    pub download_dir: Option<PathBuf>,

    // Flashing
    pub block_size: String,

    // Mounting
    /// Bound on each mount/umount call, in seconds; 0 waits forever
    pub mount_timeout_secs: u64,
    pub root_marker: String,
    pub boot_marker: String,

    // First boot
    pub enable_ssh: bool,
    /// Account whose shadow entry receives the new password hash
    pub password_user: String,
    pub password_attempts: u32,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            object: DEFAULT_OBJECT.to_string(),
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            protected: false,
            download_dir: None,
            block_size: "32M".to_string(),
            mount_timeout_secs: 30,
            root_marker: "root".to_string(),
            boot_marker: "cmdline.txt".to_string(),
            enable_ssh: true,
            password_user: "pi".to_string(),
            password_attempts: 3,
        }
    }
}

impl ProvisionConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            anyhow::bail!("Bucket must be specified");
        }
        if self.object.trim().is_empty() {
            anyhow::bail!("Object key must be specified");
        }
        if self.region.trim().is_empty() {
            anyhow::bail!("Region must be specified");
        }
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                anyhow::bail!("Endpoint must start with http:// or https://");
            }
        }
        validate_block_size(&self.block_size)?;
        if self.root_marker.trim().is_empty() || self.boot_marker.trim().is_empty() {
            anyhow::bail!("Partition markers must not be empty");
        }
        if self.password_user.is_empty() || self.password_user.contains(':') {
            anyhow::bail!("Password user must be a non-empty account name without ':'");
        }
        if self.password_attempts == 0 {
            anyhow::bail!("Password attempts must be at least 1");
        }
        Ok(())
    }

    /// Bounded wait for mount/umount, `None` when disabled
    pub fn mount_timeout(&self) -> Option<Duration> {
        (self.mount_timeout_secs > 0).then(|| Duration::from_secs(self.mount_timeout_secs))
    }
}

/// `dd` block sizes: a positive number with an optional K/M/G suffix
fn validate_block_size(size: &str) -> Result<()> {
    let digits = size.trim_end_matches(['K', 'M', 'G', 'k']);
    let suffix_len = size.len() - digits.len();
    if digits.is_empty() || suffix_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        anyhow::bail!("Invalid block size '{}' (expected e.g. 4M or 32M)", size);
    }
    if digits.parse::<u64>().map(|n| n == 0).unwrap_or(true) {
        anyhow::bail!("Block size must be greater than zero");
    }
    Ok(())
}

/// AWS credentials taken from the environment
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AwsCredentials {
    /// Read `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` (and optionally
    /// `AWS_SESSION_TOKEN`). Returns `None` unless both keys are set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Some(Self {
            access_key_id: non_empty("AWS_ACCESS_KEY_ID")?,
            secret_access_key: non_empty("AWS_SECRET_ACCESS_KEY")?,
            session_token: non_empty("AWS_SESSION_TOKEN"),
        })
    }
}
