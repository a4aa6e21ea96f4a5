//! ebtables table, chain and prefix names

use std::fmt;

/// Prefix of every managed ARP chain; the sweeper finds chains by it.
pub const ARP_CHAIN_PREFIX: &str = "neutronARP-";

/// Prefix of every managed MAC chain.
pub const MAC_CHAIN_PREFIX: &str = "neutronMAC-";

/// Built-in chain the current installation hooks into.
pub const PREROUTING_CHAIN: &str = "PREROUTING";

/// Built-in chain older installations hooked into.
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Maximum number of MACs in a single `--among-src` rule.
///
/// Feeding every allowed MAC to one rule can exceed the maximum argument size.
pub const MAX_AMONG_ENTRIES: usize = 500;

/// Table conventions the reconciler knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Current convention: `nat` table, jumps from `PREROUTING`.
    Nat,
    /// Legacy convention: `filter` table, jumps from `FORWARD`.
    /// Only cleaned up, never installed into.
    Filter,
}

impl Table {
    /// Every convention, current first.
    pub const ALL: [Table; 2] = [Table::Nat, Table::Filter];

    /// Table name as passed to `-t`.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }

    /// Built-in chain holding the jump rules for this convention.
    pub fn jump_chain(&self) -> &'static str {
        match self {
            Table::Nat => PREROUTING_CHAIN,
            Table::Filter => FORWARD_CHAIN,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two kinds of per-vif chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainKind {
    /// ARP source-IP allow-list.
    Arp,
    /// Source MAC allow-list.
    Mac,
}

impl ChainKind {
    /// Both kinds, in teardown order.
    pub const ALL: [ChainKind; 2] = [ChainKind::Arp, ChainKind::Mac];

    /// Reserved name prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            ChainKind::Arp => ARP_CHAIN_PREFIX,
            ChainKind::Mac => MAC_CHAIN_PREFIX,
        }
    }

    /// Managed chain name for `vif`.
    pub fn chain_name(&self, vif: &str) -> String {
        format!("{}{}", self.prefix(), vif)
    }

    /// Protocol filter carried by this kind's jump rule.
    pub fn jump_protocol(&self) -> Option<&'static str> {
        match self {
            ChainKind::Arp => Some("ARP"),
            ChainKind::Mac => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert_eq!(Table::Nat.name(), "nat");
        assert_eq!(Table::Nat.jump_chain(), "PREROUTING");
        assert_eq!(Table::Filter.name(), "filter");
        assert_eq!(Table::Filter.jump_chain(), "FORWARD");
        assert_eq!(Table::Nat.to_string(), "nat");
    }

    #[test]
    fn test_chain_names() {
        assert_eq!(ChainKind::Arp.chain_name("tap1"), "neutronARP-tap1");
        assert_eq!(ChainKind::Mac.chain_name("tap1"), "neutronMAC-tap1");
        assert_eq!(ChainKind::Arp.jump_protocol(), Some("ARP"));
        assert_eq!(ChainKind::Mac.jump_protocol(), None);
    }
}
