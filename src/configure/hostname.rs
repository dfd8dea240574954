//! Hostname and loopback entry for first boot.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ProvisionError, Result};

pub const HOSTNAME_FILE: &str = "etc/hostname";
pub const HOSTS_FILE: &str = "etc/hosts";

const LOOPBACK: &str = "127.0.0.1";
const LOCALHOST: &str = "localhost";

/// RFC 1123 label: 1-63 letters, digits or hyphens, no leading/trailing hyphen
pub fn validate_hostname(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name.len() > 63 {
        return Err("Hostname must be 1 to 63 characters".to_string());
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err("Hostname may only contain letters, digits and '-'".to_string());
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("Hostname must not start or end with '-'".to_string());
    }
    Ok(())
}

/// Replace the `localhost` token that follows `127.0.0.1` with `hostname`.
///
/// Only the token is substituted; the address, the whitespace between them
/// and anything after the token are kept. Other lines are untouched.
pub fn rewrite_hosts(content: &str, hostname: &str) -> (String, bool) {
    let mut out = String::with_capacity(content.len() + hostname.len());
    let mut changed = false;
    for line in content.split_inclusive('\n') {
        let (body, eol) = match line.strip_suffix("\r\n") {
            Some(body) => (body, "\r\n"),
            None => match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            },
        };
        match rewrite_loopback_line(body, hostname) {
            Some(rewritten) => {
                out.push_str(&rewritten);
                changed = true;
            }
            None => out.push_str(body),
        }
        out.push_str(eol);
    }
    (out, changed)
}

fn rewrite_loopback_line(line: &str, hostname: &str) -> Option<String> {
    for (idx, _) in line.match_indices(LOOPBACK) {
        let after_ip = idx + LOOPBACK.len();
        let rest = &line[after_ip..];
        let token_start = after_ip + (rest.len() - rest.trim_start().len());
        let Some(tail) = line[token_start..].strip_prefix(LOCALHOST) else {
            continue;
        };
        if tail.chars().next().is_some_and(|c| !c.is_whitespace()) {
            continue;
        }
        return Some(format!("{}{}{}", &line[..token_start], hostname, tail));
    }
    None
}

/// Append `hostname` as its own line in the hostname file at `path`.
pub fn append_hostname(path: &Path, hostname: &str) -> Result<()> {
    let existing = fs::read(path).map_err(|e| ProvisionError::from_edit(path, e))?;
    let mut line = String::new();
    if !existing.is_empty() && !existing.ends_with(b"\n") {
        line.push('\n');
    }
    line.push_str(hostname);
    line.push('\n');

    OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()))
        .map_err(|e| ProvisionError::from_edit(path, e))
}

/// Set `hostname` on the root filesystem mounted at `root`.
pub fn apply(root: &Path, hostname: &str) -> Result<()> {
    append_hostname(&root.join(HOSTNAME_FILE), hostname)?;

    let hosts = root.join(HOSTS_FILE);
    let content = fs::read_to_string(&hosts).map_err(|e| ProvisionError::from_edit(&hosts, e))?;
    let (rewritten, changed) = rewrite_hosts(&content, hostname);
    if changed {
        fs::write(&hosts, rewritten).map_err(|e| ProvisionError::from_edit(&hosts, e))?;
        debug!(path = %hosts.display(), "loopback entry rewritten");
    } else {
        warn!(path = %hosts.display(), "no `127.0.0.1 localhost` line to rewrite");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RASPBIAN_HOSTS: &str = "127.0.0.1\tlocalhost\n\
                                  ::1\t\tlocalhost ip6-localhost ip6-loopback\n\
                                  ff02::1\t\tip6-allnodes\n\
                                  \n\
                                  127.0.1.1\t\traspberrypi\n";

    #[test]
    fn test_rewrite_keeps_spacing() {
        let (out, changed) = rewrite_hosts("127.0.0.1   localhost\n", "mypi");
        assert!(changed);
        assert_eq!(out, "127.0.0.1   mypi\n");
    }

    #[test]
    fn test_rewrite_leaves_other_lines_alone() {
        let (out, changed) = rewrite_hosts(RASPBIAN_HOSTS, "mypi");
        assert!(changed);
        let before: Vec<_> = RASPBIAN_HOSTS.lines().collect();
        let after: Vec<_> = out.lines().collect();
        assert_eq!(after[0], "127.0.0.1\tmypi");
        assert_eq!(&after[1..], &before[1..]);
    }

    #[test]
    fn test_rewrite_only_replaces_whole_token() {
        let (out, changed) = rewrite_hosts("127.0.0.1 localhostname\n", "mypi");
        assert!(!changed);
        assert_eq!(out, "127.0.0.1 localhostname\n");

        let (out, _) = rewrite_hosts("127.0.0.1 localhost localhost.localdomain", "mypi");
        assert_eq!(out, "127.0.0.1 mypi localhost.localdomain");
    }

    #[test]
    fn test_validate_hostname() {
        let longest = "a".repeat(63);
        let too_long = "a".repeat(64);
        for ok in ["mypi", "pi-4", "A1", longest.as_str()] {
            assert!(validate_hostname(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "-pi", "pi-", "my_pi", "my.pi", "pi 4", too_long.as_str()] {
            assert!(validate_hostname(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_apply_edits_both_files() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(root.path().join("etc")).expect("mkdir");
        fs::write(root.path().join(HOSTNAME_FILE), "raspberrypi").expect("write");
        fs::write(root.path().join(HOSTS_FILE), RASPBIAN_HOSTS).expect("write");

        apply(root.path(), "mypi").expect("apply");

        assert_eq!(
            fs::read_to_string(root.path().join(HOSTNAME_FILE)).expect("read"),
            "raspberrypi\nmypi\n"
        );
        let hosts = fs::read_to_string(root.path().join(HOSTS_FILE)).expect("read");
        assert!(hosts.starts_with("127.0.0.1\tmypi\n"));
    }
}
