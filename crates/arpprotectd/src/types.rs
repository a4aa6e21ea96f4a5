//! Type definitions for arpprotectd

use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::debug;

use arpprotect_common::{ProtectError, ProtectResult};

/// Device owners starting with this prefix belong to the network itself.
pub const TRUSTED_OWNER_PREFIX: &str = "network:";

static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{1,2}(:[0-9a-f]{1,2}){5}$").expect("Invalid regex pattern")
});

/// Desired anti-spoofing policy for one port.
///
/// Supplied per call and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPolicy {
    /// Primary MAC address of the port.
    pub mac_address: String,
    /// Fixed IP addresses (any family; only IPv4 is used).
    pub fixed_ips: BTreeSet<String>,
    /// IPs from allowed address pairs, plain or CIDR.
    pub allowed_pair_ips: BTreeSet<String>,
    /// MACs from allowed address pairs.
    pub allowed_pair_macs: BTreeSet<String>,
    /// When false, every managed rule for the port is removed.
    pub port_security_enabled: bool,
    /// Trusted ports get no protection.
    pub trusted: bool,
    /// Owner of the port, e.g. `compute:nova` or `network:dhcp`.
    pub device_owner: Option<String>,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self {
            mac_address: String::new(),
            fixed_ips: BTreeSet::new(),
            allowed_pair_ips: BTreeSet::new(),
            allowed_pair_macs: BTreeSet::new(),
            port_security_enabled: true,
            trusted: false,
            device_owner: None,
        }
    }
}

impl PortPolicy {
    /// Creates a protected policy for a port with the given MAC.
    pub fn new(mac_address: impl Into<String>) -> Self {
        Self {
            mac_address: mac_address.into(),
            ..Self::default()
        }
    }

    /// Adds a fixed IP.
    pub fn with_fixed_ip(mut self, ip: impl Into<String>) -> Self {
        self.fixed_ips.insert(ip.into());
        self
    }

    /// Adds an allowed address pair.
    pub fn with_allowed_pair(mut self, ip: impl Into<String>, mac: impl Into<String>) -> Self {
        self.allowed_pair_ips.insert(ip.into());
        self.allowed_pair_macs.insert(mac.into());
        self
    }

    /// Returns true if the port is trusted, explicitly or by its owner.
    pub fn is_trusted(&self) -> bool {
        self.trusted
            || self
                .device_owner
                .as_deref()
                .is_some_and(|owner| owner.starts_with(TRUSTED_OWNER_PREFIX))
    }

    /// Returns true if rules should be installed for this port.
    pub fn needs_protection(&self) -> bool {
        self.port_security_enabled && !self.is_trusted()
    }

    /// Fixed and allowed-pair addresses that are valid IPv4.
    pub fn ipv4_addresses(&self) -> BTreeSet<ArpAddress> {
        collect_ipv4(self.fixed_ips.iter().chain(self.allowed_pair_ips.iter()))
    }

    /// Checks that the primary MAC is usable.
    ///
    /// Without it the MAC chain would drop every frame from the port.
    pub fn validate(&self, vif: &str) -> ProtectResult<()> {
        let mac = self.mac_address.trim().to_ascii_lowercase();
        if mac.is_empty() {
            return Err(ProtectError::invalid_policy(vif, "missing MAC address"));
        }
        if !MAC_RE.is_match(&mac) {
            return Err(ProtectError::invalid_policy(
                vif,
                format!("malformed MAC address '{}'", self.mac_address),
            ));
        }
        Ok(())
    }

    /// Primary and allowed-pair MACs, lowercased; malformed entries dropped.
    pub fn allowed_macs(&self) -> BTreeSet<String> {
        std::iter::once(&self.mac_address)
            .chain(self.allowed_pair_macs.iter())
            .filter_map(|mac| {
                let mac = mac.trim().to_ascii_lowercase();
                if MAC_RE.is_match(&mac) {
                    Some(mac)
                } else {
                    if !mac.is_empty() {
                        debug!(mac = %mac, "Ignoring malformed MAC address");
                    }
                    None
                }
            })
            .collect()
    }
}

/// An IPv4 host or network usable as `--arp-ip-src`.
///
/// Ordered numerically by address, then prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArpAddress {
    addr: Ipv4Addr,
    prefix: u8,
}

impl ArpAddress {
    /// Creates an address with the given prefix length.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    /// Returns the address part.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Returns the prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// A /0 matches everything, which `--arp-ip-src` cannot express.
    pub fn is_match_all(&self) -> bool {
        self.prefix == 0
    }
}

impl FromStr for ArpAddress {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match IpNetwork::from_str(s.trim()) {
            Ok(IpNetwork::V4(net)) => Ok(Self::new(net.ip(), net.prefix())),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ArpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix == 32 {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix)
        }
    }
}

/// Parses addresses, keeping only valid IPv4.
///
/// IPv6 and unparsable inputs are dropped silently.
pub fn collect_ipv4<I, S>(addresses: I) -> BTreeSet<ArpAddress>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    addresses
        .into_iter()
        .filter_map(|s| {
            let parsed = s.as_ref().parse::<ArpAddress>().ok();
            if parsed.is_none() {
                debug!(address = %s.as_ref(), "Skipping non-IPv4 address");
            }
            parsed
        })
        .collect()
}

/// Returns true if any address is a /0.
pub fn contains_match_all(addresses: &BTreeSet<ArpAddress>) -> bool {
    addresses.iter().any(ArpAddress::is_match_all)
}
