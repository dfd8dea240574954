//! Wi-Fi credentials for first boot.
//!
//! The network key is turned into a supplicant stanza by `wpa_passphrase`;
//! only the derived PSK reaches the card.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

use crate::command::{CommandRunner, WpaPassphraseArgs};
use crate::error::{ProvisionError, Result};

/// Supplicant config, relative to the root filesystem
pub const SUPPLICANT_CONF: &str = "etc/wpa_supplicant/wpa_supplicant.conf";

const STANZA_HEADER: &str = "network={";

/// SSID and pre-shared key entered by the user. Lives in memory only.
#[derive(Clone)]
pub struct NetworkCredential {
    pub ssid: String,
    pub psk: String,
}

impl fmt::Debug for NetworkCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredential")
            .field("ssid", &self.ssid)
            .field("psk", &"<redacted>")
            .finish()
    }
}

pub fn validate_ssid(ssid: &str) -> std::result::Result<(), String> {
    match ssid.len() {
        0 => Err("The network name must not be empty".to_string()),
        1..=32 => Ok(()),
        _ => Err("The network name must be at most 32 bytes".to_string()),
    }
}

/// WPA-PSK passphrases are 8-63 printable ASCII characters
pub fn validate_psk(psk: &str) -> std::result::Result<(), String> {
    if !(8..=63).contains(&psk.len()) {
        return Err("The network password must be 8 to 63 characters".to_string());
    }
    if !psk.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err("The network password must be printable ASCII".to_string());
    }
    Ok(())
}

/// Run `wpa_passphrase` and return the sanitized stanza.
pub fn derive_stanza(runner: &dyn CommandRunner, credential: &NetworkCredential) -> Result<String> {
    let args = WpaPassphraseArgs {
        ssid: credential.ssid.clone(),
        passphrase: credential.psk.clone(),
    };
    let output = runner.run(&args, None)?.ensure_success("wpa_passphrase")?;
    sanitize_supplicant_stanza(&output.stdout)
}

/// Strip everything before the `network={` header and the commented-out
/// plaintext `#psk="..."` line.
pub fn sanitize_supplicant_stanza(raw: &str) -> Result<String> {
    let mut lines = raw
        .lines()
        .skip_while(|line| !line.trim_start().starts_with(STANZA_HEADER))
        .peekable();

    if lines.peek().is_none() {
        return Err(ProvisionError::CommandFailed {
            program: "wpa_passphrase".to_string(),
            code: 0,
            stderr: "output contained no network block".to_string(),
        });
    }

    let mut stanza = String::new();
    for line in lines.filter(|line| !line.trim_start().starts_with("#psk=")) {
        stanza.push_str(line);
        stanza.push('\n');
    }
    Ok(stanza)
}

/// Append `stanza` to the supplicant config at `conf`, keeping existing content.
pub fn append_stanza(conf: &Path, stanza: &str) -> Result<()> {
    let needs_newline = match fs::read(conf) {
        Ok(existing) => !existing.is_empty() && !existing.ends_with(b"\n"),
        Err(e) => return Err(ProvisionError::from_edit(conf, e)),
    };

    let mut file = OpenOptions::new()
        .append(true)
        .open(conf)
        .map_err(|e| ProvisionError::from_edit(conf, e))?;
    if needs_newline {
        file.write_all(b"\n").map_err(|e| ProvisionError::from_edit(conf, e))?;
    }
    file.write_all(stanza.as_bytes())
        .map_err(|e| ProvisionError::from_edit(conf, e))?;
    debug!(path = %conf.display(), "supplicant stanza appended");
    Ok(())
}
