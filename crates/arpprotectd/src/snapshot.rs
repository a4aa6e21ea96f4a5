//! Parsed view of an `ebtables -L` listing.
//!
//! The listing is the only state store: nothing is cached between calls and
//! every query here is a pure function over the lines of one listing. A
//! listing looks like:
//!
//! ```text
//! Bridge table: nat
//!
//! Bridge chain: PREROUTING, entries: 2, policy: ACCEPT
//! -p ARP -i tap1 -j neutronARP-tap1
//! -i tap1 -j neutronMAC-tap1
//!
//! Bridge chain: neutronARP-tap1, entries: 1, policy: DROP
//! -p ARP --arp-ip-src 10.0.0.5 -j ACCEPT
//!
//! Bridge chain: neutronMAC-tap1, entries: 1, policy: DROP
//! -i tap1 --among-src fa:16:3e:0:0:1, -j RETURN
//! ```
//!
//! Rule matching is done on whitespace-separated tokens, so `-i tap1` never
//! matches a rule for `tap10`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::tables::{ChainKind, Table};

/// Marker that starts every chain header line.
pub const CHAIN_MARKER: &str = "Bridge chain: ";

static CHAIN_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Bridge chain: ([^,\s]+), entries: (\d+), policy: (\S+)")
        .expect("Invalid regex pattern")
});

/// One chain of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedChain {
    /// Chain name.
    pub name: String,
    /// Default policy (`ACCEPT`, `DROP`, `RETURN`).
    pub policy: String,
    /// Rule lines, trimmed, in listing order.
    pub rules: Vec<String>,
}

/// Snapshot of one table, taken immediately before mutating it.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    table: Table,
    lines: Vec<String>,
    chains: Vec<ListedChain>,
}

impl RuleSnapshot {
    /// Parses the raw output of `ebtables -t <table> -L`.
    pub fn parse(table: Table, listing: &str) -> Self {
        let lines: Vec<String> = listing.lines().map(str::to_string).collect();
        let mut chains: Vec<ListedChain> = Vec::new();

        for line in &lines {
            if let Some(caps) = CHAIN_HEADER_RE.captures(line) {
                chains.push(ListedChain {
                    name: caps[1].to_string(),
                    policy: caps[3].to_string(),
                    rules: Vec::new(),
                });
                continue;
            }
            let rule = line.trim();
            if rule.starts_with('-') {
                if let Some(chain) = chains.last_mut() {
                    chain.rules.push(rule.to_string());
                }
            }
        }

        Self {
            table,
            lines,
            chains,
        }
    }

    /// Table this snapshot was taken from.
    pub fn table(&self) -> Table {
        self.table
    }

    /// Raw listing lines, in order.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Parsed chains, in listing order.
    pub fn chains(&self) -> &[ListedChain] {
        &self.chains
    }

    /// Looks up a chain by name.
    pub fn chain(&self, name: &str) -> Option<&ListedChain> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// True if a listing line starts with the header of `name`.
    pub fn chain_exists(&self, name: &str) -> bool {
        let header = format!("{CHAIN_MARKER}{name},");
        self.lines.iter().any(|line| line.starts_with(&header))
    }

    /// True if one rule jumps from `vif` into its chain of the given kind.
    ///
    /// ARP jumps must also carry `-p ARP`.
    pub fn jump_present(&self, vif: &str, kind: ChainKind) -> bool {
        let target = kind.chain_name(vif);
        self.rules().any(|rule| {
            let tokens = tokenize(rule);
            has_option(&tokens, "-i", vif)
                && has_option(&tokens, "-j", &target)
                && kind
                    .jump_protocol()
                    .map_or(true, |proto| has_option(&tokens, "-p", proto))
        })
    }

    /// Vif ids embedded in the names of chains starting with `prefix`.
    pub fn managed_vifs(&self, prefix: &str) -> BTreeSet<String> {
        self.chains
            .iter()
            .filter_map(|c| c.name.strip_prefix(prefix))
            .filter(|vif| !vif.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Vifs owning any managed chain, ARP or MAC.
    pub fn all_managed_vifs(&self) -> BTreeSet<String> {
        ChainKind::ALL
            .iter()
            .flat_map(|kind| self.managed_vifs(kind.prefix()))
            .collect()
    }

    /// `--among-src` rules for `vif` in its MAC chain, as listed.
    pub fn membership_rules(&self, vif: &str) -> Vec<&str> {
        let Some(chain) = self.chain(&ChainKind::Mac.chain_name(vif)) else {
            return Vec::new();
        };
        chain
            .rules
            .iter()
            .filter(|rule| {
                let tokens = tokenize(rule);
                has_option(&tokens, "-i", vif) && tokens.contains(&"--among-src")
            })
            .map(String::as_str)
            .collect()
    }

    fn rules(&self) -> impl Iterator<Item = &str> {
        self.chains
            .iter()
            .flat_map(|c| c.rules.iter().map(String::as_str))
    }
}

/// Managed vifs present in `snapshot` but absent from `current_vifs`.
pub fn orphaned_vifs(snapshot: &RuleSnapshot, current_vifs: &BTreeSet<String>) -> Vec<String> {
    snapshot
        .all_managed_vifs()
        .into_iter()
        .filter(|vif| !current_vifs.contains(vif))
        .collect()
}

fn tokenize(rule: &str) -> Vec<&str> {
    rule.split_whitespace().collect()
}

fn has_option(tokens: &[&str], flag: &str, value: &str) -> bool {
    tokens.windows(2).any(|w| w[0] == flag && w[1] == value)
}
