//! Property-Based Tests for the card edits
//!
//! These tests verify:
//! - Hosts rewrite substitutes only the loopback `localhost` token
//! - Supplicant stanzas never keep the plaintext key
//! - Shadow substitution touches only the locked entry of the target user
//! - Mount table parsing recovers device and mount point

use proptest::prelude::*;

use dephy_pi::configure::hostname::rewrite_hosts;
use dephy_pi::configure::password::replace_shadow_password;
use dephy_pi::configure::wifi::sanitize_supplicant_stanza;
use dephy_pi::disk::parse_mount_table;
use std::path::PathBuf;

fn hostname_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,30}[a-z0-9]"
}

/// Hosts-file lines that never mention the IPv4 loopback address
fn unrelated_line_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9:. \t#-]{0,40}".prop_filter("no loopback", |l| !l.contains("127.0.0.1"))
}

// =============================================================================
// Hosts rewrite
// =============================================================================

proptest! {
    /// The loopback line keeps its spacing; only the token changes
    #[test]
    fn hosts_loopback_token_is_replaced(
        host in hostname_strategy(),
        spacing in "[ \t]{1,8}",
        before in prop::collection::vec(unrelated_line_strategy(), 0..5),
        after in prop::collection::vec(unrelated_line_strategy(), 0..5),
    ) {
        let mut lines = before.clone();
        lines.push(format!("127.0.0.1{}localhost", spacing));
        lines.extend(after.clone());
        let content = lines.join("\n") + "\n";

        let (rewritten, changed) = rewrite_hosts(&content, &host);
        prop_assert!(changed);

        let out: Vec<&str> = rewritten.lines().collect();
        prop_assert_eq!(out.len(), lines.len());
        prop_assert_eq!(out[before.len()], format!("127.0.0.1{}{}", spacing, host));
        for (i, line) in out.iter().enumerate() {
            if i != before.len() {
                prop_assert_eq!(*line, lines[i].as_str());
            }
        }
    }

    /// Content without a loopback entry passes through byte for byte
    #[test]
    fn hosts_without_loopback_is_unchanged(
        host in hostname_strategy(),
        lines in prop::collection::vec(unrelated_line_strategy(), 0..8),
        trailing_newline in any::<bool>(),
    ) {
        let mut content = lines.join("\n");
        if trailing_newline {
            content.push('\n');
        }
        let (rewritten, changed) = rewrite_hosts(&content, &host);
        prop_assert!(!changed);
        prop_assert_eq!(rewritten, content);
    }

    /// `localhost` must be a whole token
    #[test]
    fn hosts_longer_token_is_not_rewritten(
        host in hostname_strategy(),
        suffix in "[a-z0-9.-]{1,10}",
    ) {
        let content = format!("127.0.0.1 localhost{}\n", suffix);
        let (rewritten, changed) = rewrite_hosts(&content, &host);
        prop_assert!(!changed);
        prop_assert_eq!(rewritten, content);
    }
}

// =============================================================================
// Supplicant stanza
// =============================================================================

proptest! {
    #[test]
    fn stanza_drops_commented_key(
        ssid in "[A-Za-z0-9 _-]{1,32}",
        psk in "[!#-~]{8,63}",
        derived in "[0-9a-f]{64}",
        preamble in prop::collection::vec("# [a-z ]{0,20}", 0..3),
    ) {
        let mut raw = preamble.join("\n");
        if !raw.is_empty() {
            raw.push('\n');
        }
        raw.push_str(&format!(
            "network={{\n\tssid=\"{}\"\n\t#psk=\"{}\"\n\tpsk={}\n}}\n",
            ssid, psk, derived
        ));

        let stanza = sanitize_supplicant_stanza(&raw).expect("stanza");
        prop_assert!(stanza.starts_with("network={"), "stanza header: {:?}", stanza);
        prop_assert!(!stanza.contains("#psk"));
        let derived_line = format!("\tpsk={}", derived);
        prop_assert!(stanza.lines().any(|l| l == derived_line));
        prop_assert!(stanza.ends_with("}\n"), "stanza footer: {:?}", stanza);
    }
}

// =============================================================================
// Shadow substitution
// =============================================================================

fn shadow_line_strategy() -> impl Strategy<Value = (String, bool)> {
    (
        prop_oneof![Just("pi".to_string()), Just("root".to_string()), "[a-z]{1,8}"],
        any::<bool>(),
    )
}

proptest! {
    #[test]
    fn shadow_only_locked_target_entries_change(
        entries in prop::collection::vec(shadow_line_strategy(), 0..10),
        salt in "[./0-9A-Za-z]{16}",
    ) {
        let hash = format!("$6${}$abcdefghijklmnop", salt);
        let content: String = entries
            .iter()
            .map(|(user, locked)| {
                let password = if *locked { "*" } else { "$6$old$hash" };
                format!("{}:{}:19000:0:99999:7:::\n", user, password)
            })
            .collect();

        let (updated, replaced) = replace_shadow_password(&content, "pi", &hash);
        let expected = entries.iter().filter(|(u, locked)| u == "pi" && *locked).count();
        prop_assert_eq!(replaced, expected);

        let before: Vec<&str> = content.lines().collect();
        let after: Vec<&str> = updated.lines().collect();
        prop_assert_eq!(before.len(), after.len());
        for ((old, new), (user, locked)) in before.iter().zip(&after).zip(&entries) {
            if user == "pi" && *locked {
                let replaced_line = format!("pi:{}:19000:0:99999:7:::", hash);
                prop_assert_eq!(*new, replaced_line.as_str());
            } else {
                prop_assert_eq!(old, new);
            }
        }
    }
}

// =============================================================================
// Mount table parsing
// =============================================================================

proptest! {
    #[test]
    fn mount_table_round_trips_plain_paths(
        mounts in prop::collection::vec(("sd[a-z][1-9]", "/[a-z]{1,8}(/[a-z0-9_]{1,8}){0,3}"), 0..8),
    ) {
        let table: String = mounts
            .iter()
            .map(|(dev, mp)| format!("/dev/{} {} vfat rw,relatime 0 0\n", dev, mp))
            .collect();

        let entries = parse_mount_table(&table);
        prop_assert_eq!(entries.len(), mounts.len());
        for (entry, (dev, mp)) in entries.iter().zip(&mounts) {
            prop_assert_eq!(&entry.device, &PathBuf::from(format!("/dev/{}", dev)));
            prop_assert_eq!(&entry.mount_point, &PathBuf::from(mp));
            prop_assert_eq!(entry.fs_type.as_str(), "vfat");
        }
    }

    /// Spaces in mount points arrive as `\040`
    #[test]
    fn mount_table_unescapes_spaces(
        label in "[A-Za-z]{1,6}",
        rest in "[A-Za-z]{1,6}",
    ) {
        let table = format!("/dev/sdb1 /media/user/{}\\040{} vfat rw 0 0\n", label, rest);
        let entries = parse_mount_table(&table);
        prop_assert_eq!(entries.len(), 1);
        prop_assert_eq!(
            &entries[0].mount_point,
            &PathBuf::from(format!("/media/user/{} {}", label, rest))
        );
    }
}
