//! SSH enable marker.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Marker at the top of the boot filesystem (`/boot/ssh` on the device)
pub const SSH_MARKER: &str = "ssh";

/// Create the empty SSH marker under `boot`.
///
/// Returns false if the marker already existed; its contents are left as is.
pub fn enable(boot: &Path) -> Result<bool> {
    let marker = boot.join(SSH_MARKER);
    match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => {
            debug!(path = %marker.display(), "ssh marker created");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!(path = %marker.display(), "ssh marker already present");
            Ok(false)
        }
        Err(e) => Err(ProvisionError::from_edit(marker, e)),
    }
}
