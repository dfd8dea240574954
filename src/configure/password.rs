//! Root password change via the shadow file.
//!
//! Both entries are hashed with one shared salt and the hashes compared in
//! constant time, so a match means the derived hashes agree, not just the raw
//! input. Only an account whose password field is the locked marker `*` is
//! changed.

use rand::Rng;
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{ProvisionError, Result};
use crate::prompt::Prompter;
use crate::ui::Reporter;

pub const SHADOW_FILE: &str = "etc/shadow";
pub const LOCKED_PASSWORD: &str = "*";

const SALT_LEN: usize = 16;
const SALT_CHARS: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random 16-character crypt salt
pub fn generate_salt() -> String {
    let mut rng = rand::thread_rng();
    (0..SALT_LEN)
        .map(|_| SALT_CHARS[rng.gen_range(0..SALT_CHARS.len())] as char)
        .collect()
}

/// SHA-512 crypt (`$6$<salt>$<hash>`)
pub fn hash_password(password: &str, salt: &str) -> Result<String> {
    pwhash::sha512_crypt::hash_with(format!("$6${}", salt).as_str(), password)
        .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))
}

fn non_empty(input: &str) -> std::result::Result<(), String> {
    if input.is_empty() {
        Err("The password must not be empty".to_string())
    } else {
        Ok(())
    }
}

/// Ask for a password twice, up to `attempts` times, and return its hash.
///
/// Fails with `CredentialMismatch` once every attempt has been used.
pub fn prompt_matching_password(
    prompter: &dyn Prompter,
    reporter: &Reporter,
    user: &str,
    attempts: u32,
) -> Result<String> {
    for attempt in 1..=attempts {
        let first = prompter.secret(&format!("Enter a new password for `{}`:", user), Some(non_empty))?;
        let second = prompter.secret("Re-enter password:", None)?;

        let salt = generate_salt();
        let first = hash_password(&first, &salt)?;
        let second = hash_password(&second, &salt)?;

        if bool::from(first.as_bytes().ct_eq(second.as_bytes())) {
            debug!(attempt, "password confirmed");
            return Ok(first);
        }

        reporter.warn("Passwords do not match!");
        let remaining = attempts - attempt;
        if remaining > 0 {
            reporter.warn(&format!("{} attempts remaining.", remaining));
        }
    }
    reporter.error("max attempts reached!");
    Err(ProvisionError::CredentialMismatch { attempts })
}

/// Put `hash` into `user`'s password field if it holds the locked marker.
///
/// Returns the new content and the number of lines changed.
pub fn replace_shadow_password(content: &str, user: &str, hash: &str) -> (String, usize) {
    let mut out = String::with_capacity(content.len() + hash.len());
    let mut replaced = 0;
    for line in content.split_inclusive('\n') {
        let (body, eol) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let mut fields: Vec<&str> = body.split(':').collect();
        if fields.len() > 1 && fields[0] == user && fields[1] == LOCKED_PASSWORD {
            fields[1] = hash;
            out.push_str(&fields.join(":"));
            replaced += 1;
        } else {
            out.push_str(body);
        }
        out.push_str(eol);
    }
    (out, replaced)
}

/// Install `hash` for `user` in the shadow file at `path`.
///
/// The file is replaced atomically with its owner and mode preserved.
/// Returns false (after a warning) if no locked entry for `user` was found.
pub fn install_password_hash(path: &Path, user: &str, hash: &str) -> Result<bool> {
    let edit_err = |e: std::io::Error| ProvisionError::from_edit(path, e);

    let content = fs::read_to_string(path).map_err(edit_err)?;
    let (updated, replaced) = replace_shadow_password(&content, user, hash);
    if replaced == 0 {
        warn!(user, path = %path.display(), "no locked shadow entry to replace");
        return Ok(false);
    }

    let metadata = fs::metadata(path).map_err(edit_err)?;
    let parent = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(edit_err)?;
    tmp.write_all(updated.as_bytes()).map_err(edit_err)?;
    tmp.as_file().sync_all().map_err(edit_err)?;
    std::os::unix::fs::fchown(tmp.as_file(), Some(metadata.uid()), Some(metadata.gid()))
        .map_err(edit_err)?;
    tmp.as_file()
        .set_permissions(metadata.permissions())
        .map_err(edit_err)?;
    tmp.persist(path).map_err(|e| edit_err(e.error))?;

    debug!(user, path = %path.display(), "shadow entry updated");
    Ok(true)
}
