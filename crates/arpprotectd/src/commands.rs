//! ebtables argument builders
//!
//! Every builder returns the arguments that follow `-t <table> --concurrent`;
//! the executor adds the binary, table selection and privilege wrapping.

use crate::tables::{ChainKind, Table};
use crate::types::ArpAddress;

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// List every chain of the table
pub fn build_list_cmd() -> Vec<String> {
    args(["-L"])
}

/// Create a managed chain with a default DROP policy
pub fn build_new_chain_cmd(chain: &str) -> Vec<String> {
    args(["-N", chain, "-P", "DROP"])
}

/// Remove every rule from a chain
pub fn build_flush_chain_cmd(chain: &str) -> Vec<String> {
    args(["-F", chain])
}

/// Delete a chain
pub fn build_delete_chain_cmd(chain: &str) -> Vec<String> {
    args(["-X", chain])
}

/// Accept ARP packets claiming `address` as their source
pub fn build_arp_accept_cmd(chain: &str, address: &ArpAddress) -> Vec<String> {
    let address = address.to_string();
    args(["-A", chain, "-p", "ARP", "--arp-ip-src", address.as_str(), "-j", "ACCEPT"])
}

fn jump_args(op: &str, table: Table, kind: ChainKind, vif: &str) -> Vec<String> {
    let chain = kind.chain_name(vif);
    let mut cmd = args([op, table.jump_chain(), "-i", vif, "-j", chain.as_str()]);
    if let Some(proto) = kind.jump_protocol() {
        cmd.extend(args(["-p", proto]));
    }
    cmd
}

/// Route traffic entering through `vif` into its managed chain
pub fn build_add_jump_cmd(table: Table, kind: ChainKind, vif: &str) -> Vec<String> {
    jump_args("-A", table, kind, vif)
}

/// Remove the jump installed by [`build_add_jump_cmd`]
pub fn build_delete_jump_cmd(table: Table, kind: ChainKind, vif: &str) -> Vec<String> {
    jump_args("-D", table, kind, vif)
}

/// Let frames from `vif` with a source MAC in `macs` return from the chain
pub fn build_among_src_cmd(chain: &str, vif: &str, macs: &[&str]) -> Vec<String> {
    let members = macs.join(",");
    args(["-A", chain, "-i", vif, "--among-src", members.as_str(), "-j", "RETURN"])
}

/// Delete a rule exactly as it appears in a `-L` listing
pub fn build_delete_listed_rule_cmd(chain: &str, listed_rule: &str) -> Vec<String> {
    let mut cmd = args(["-D", chain]);
    cmd.extend(listed_rule.split_whitespace().map(str::to_string));
    cmd
}
