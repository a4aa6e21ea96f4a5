//! arpprotectd - ARP and MAC anti-spoofing reconciler for ebtables
//!
//! Installs, rewrites and removes per-vif ebtables chains that only let a
//! port's own MAC and IPv4 addresses through. The live rule listing is the
//! only state; every call snapshots it under a serialization lock and
//! converges from there.

mod arp_protect_mgr;
mod chains;
mod commands;
pub mod config;
mod executor;
mod snapshot;
mod tables;
mod types;

pub use arp_protect_mgr::ArpProtectMgr;
pub use chains::ChainManager;
pub use commands::*;
pub use config::ArpProtectConfig;
pub use executor::{EbtablesExecutor, EbtablesSettings};
pub use snapshot::{orphaned_vifs, ListedChain, RuleSnapshot};
pub use tables::*;
pub use types::*;
