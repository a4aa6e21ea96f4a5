//! Test fixtures for anti-spoofing scenarios
//!
//! Provides reusable vif names, MAC sets and literal listings.

use std::collections::BTreeSet;

/// Builds a set of strings.
pub fn string_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// `count` distinct, well-formed MAC addresses in the `fa:16:3e` OUI.
pub fn generated_macs(count: usize) -> BTreeSet<String> {
    (0..count)
        .map(|i| {
            format!(
                "fa:16:3e:{:02x}:{:02x}:{:02x}",
                (i >> 16) & 0xff,
                (i >> 8) & 0xff,
                i & 0xff
            )
        })
        .collect()
}

/// Literal listings as printed by `ebtables -L`.
pub mod listing_fixtures {
    /// Empty `nat` table.
    pub const EMPTY_NAT: &str = "\
Bridge table: nat

Bridge chain: PREROUTING, entries: 0, policy: ACCEPT

Bridge chain: OUTPUT, entries: 0, policy: ACCEPT

Bridge chain: POSTROUTING, entries: 0, policy: ACCEPT
";

    /// Seeding commands for a fully protected vif in the `nat` table.
    ///
    /// Apply with `FakeEbtables::seed("nat", ..)` in order.
    pub fn protected_vif_commands(vif: &str, ip: &str, mac: &str) -> Vec<Vec<String>> {
        let arp_chain = format!("neutronARP-{vif}");
        let mac_chain = format!("neutronMAC-{vif}");
        let cmds: Vec<Vec<&str>> = vec![
            vec!["-N", arp_chain.as_str(), "-P", "DROP"],
            vec!["-A", arp_chain.as_str(), "-p", "ARP", "--arp-ip-src", ip, "-j", "ACCEPT"],
            vec!["-A", "PREROUTING", "-i", vif, "-j", arp_chain.as_str(), "-p", "ARP"],
            vec!["-N", mac_chain.as_str(), "-P", "DROP"],
            vec!["-A", "PREROUTING", "-i", vif, "-j", mac_chain.as_str()],
            vec!["-A", mac_chain.as_str(), "-i", vif, "--among-src", mac, "-j", "RETURN"],
        ];
        cmds.into_iter()
            .map(|c| c.into_iter().map(str::to_string).collect())
            .collect()
    }

    /// Seeding commands for a legacy installation in the `filter` table.
    pub fn legacy_vif_commands(vif: &str, ip: &str) -> Vec<Vec<String>> {
        let arp_chain = format!("neutronARP-{vif}");
        let cmds: Vec<Vec<&str>> = vec![
            vec!["-N", arp_chain.as_str(), "-P", "DROP"],
            vec!["-A", arp_chain.as_str(), "-p", "ARP", "--arp-ip-src", ip, "-j", "ACCEPT"],
            vec!["-A", "FORWARD", "-i", vif, "-j", arp_chain.as_str(), "-p", "ARP"],
        ];
        cmds.into_iter()
            .map(|c| c.into_iter().map(str::to_string).collect())
            .collect()
    }
}
