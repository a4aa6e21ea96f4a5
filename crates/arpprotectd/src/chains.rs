//! Per-vif chain lifecycle: create, rewrite, wire and tear down.
//!
//! All decisions are taken against a [`RuleSnapshot`] read under the
//! serialization lock just before the call.
//!
//! The two install paths order their steps differently:
//!
//! - ARP: flush, then add. ARP is briefly denied while the chain is rewritten.
//! - MAC: add, then remove stale. Old and new allow-lists are briefly both
//!   active.

use std::collections::BTreeSet;
use tracing::{debug, info};

use arpprotect_common::{ProtectError, ProtectResult};

use crate::commands::{
    build_add_jump_cmd, build_among_src_cmd, build_arp_accept_cmd, build_delete_chain_cmd,
    build_delete_jump_cmd, build_delete_listed_rule_cmd, build_flush_chain_cmd,
    build_new_chain_cmd,
};
use crate::executor::EbtablesExecutor;
use crate::snapshot::RuleSnapshot;
use crate::tables::{ChainKind, Table, MAX_AMONG_ENTRIES};
use crate::types::ArpAddress;

/// Issues chain-level commands through an executor.
pub struct ChainManager<'a> {
    exec: &'a EbtablesExecutor,
}

impl<'a> ChainManager<'a> {
    /// Creates a manager over `exec`.
    pub fn new(exec: &'a EbtablesExecutor) -> Self {
        Self { exec }
    }

    async fn create_chain_if_absent(
        &self,
        table: Table,
        chain: &str,
        snapshot: &RuleSnapshot,
    ) -> ProtectResult<()> {
        if !snapshot.chain_exists(chain) {
            self.exec.run(table, &build_new_chain_cmd(chain)).await?;
            info!(table = %table, chain = %chain, "Created chain");
        }
        Ok(())
    }

    async fn add_jump_if_absent(
        &self,
        table: Table,
        kind: ChainKind,
        vif: &str,
        snapshot: &RuleSnapshot,
    ) -> ProtectResult<()> {
        if !snapshot.jump_present(vif, kind) {
            self.exec.run(table, &build_add_jump_cmd(table, kind, vif)).await?;
            debug!(table = %table, vif = %vif, ?kind, "Installed jump rule");
        }
        Ok(())
    }

    /// Rewrites the ARP chain of `vif` to accept exactly `addresses`.
    ///
    /// Rules are appended in ascending address order.
    pub async fn ensure_arp_chain(
        &self,
        vif: &str,
        addresses: &BTreeSet<ArpAddress>,
        snapshot: &RuleSnapshot,
    ) -> ProtectResult<()> {
        let table = snapshot.table();
        let chain = ChainKind::Arp.chain_name(vif);

        self.create_chain_if_absent(table, &chain, snapshot).await?;
        self.exec.run(table, &build_flush_chain_cmd(&chain)).await?;
        for addr in addresses {
            self.exec.run(table, &build_arp_accept_cmd(&chain, addr)).await?;
        }
        self.add_jump_if_absent(table, ChainKind::Arp, vif, snapshot).await?;

        debug!(vif = %vif, count = addresses.len(), "ARP allow-list installed");
        Ok(())
    }

    /// Rewrites the MAC chain of `vif` to let exactly `macs` through.
    ///
    /// New membership rules go in before the rules listed in `snapshot` are
    /// removed.
    pub async fn ensure_mac_chain(
        &self,
        vif: &str,
        macs: &BTreeSet<String>,
        snapshot: &RuleSnapshot,
    ) -> ProtectResult<()> {
        if macs.is_empty() {
            return Err(ProtectError::invalid_policy(vif, "no valid MAC address to allow"));
        }
        let table = snapshot.table();
        let chain = ChainKind::Mac.chain_name(vif);

        self.create_chain_if_absent(table, &chain, snapshot).await?;
        self.add_jump_if_absent(table, ChainKind::Mac, vif, snapshot).await?;

        let macs: Vec<&str> = macs.iter().map(String::as_str).collect();
        for chunk in macs.chunks(MAX_AMONG_ENTRIES) {
            self.exec
                .run(table, &build_among_src_cmd(&chain, vif, chunk))
                .await?;
        }

        // `-D` removes the first matching rule, which is the older copy when
        // an unchanged rule was just appended again.
        for stale in snapshot.membership_rules(vif) {
            self.exec
                .run(table, &build_delete_listed_rule_cmd(&chain, stale))
                .await?;
        }

        debug!(vif = %vif, count = macs.len(), "MAC allow-list installed");
        Ok(())
    }

    /// Removes jumps, then chains, of every vif in `vifs` from the snapshot's table.
    ///
    /// Only what the snapshot shows is removed, so calling this on clean
    /// state issues no commands.
    pub async fn teardown(&self, vifs: &[String], snapshot: &RuleSnapshot) -> ProtectResult<()> {
        let table = snapshot.table();

        for kind in ChainKind::ALL {
            for vif in vifs.iter().filter(|vif| snapshot.jump_present(vif, kind)) {
                self.exec
                    .run(table, &build_delete_jump_cmd(table, kind, vif))
                    .await?;
            }
        }

        for kind in ChainKind::ALL {
            for vif in vifs {
                let chain = kind.chain_name(vif);
                if snapshot.chain_exists(&chain) {
                    self.exec.run(table, &build_delete_chain_cmd(&chain)).await?;
                    info!(table = %table, chain = %chain, "Removed chain");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EbtablesSettings;
    use arpprotect_common::RetryPolicy;
    use arpprotect_test::{generated_macs, listing_fixtures, FakeEbtables};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn executor(engine: &FakeEbtables) -> EbtablesExecutor {
        EbtablesExecutor::new(
            Arc::new(engine.clone()),
            EbtablesSettings {
                root_helper: Vec::new(),
                ..EbtablesSettings::default()
            },
            RetryPolicy::default(),
        )
    }

    fn lines(engine: &FakeEbtables) -> Vec<String> {
        engine.mutations().iter().map(|c| c.line()).collect()
    }

    #[tokio::test]
    async fn test_ensure_arp_chain_on_existing_chain() {
        let engine = FakeEbtables::new();
        engine.seed_commands(
            "nat",
            &listing_fixtures::protected_vif_commands("tap1", "10.0.0.5", "fa:16:3e:00:00:01"),
        );
        let exec = executor(&engine);
        let snapshot = exec.snapshot(Table::Nat).await.unwrap();
        engine.clear_history();

        let addresses: BTreeSet<ArpAddress> = [ArpAddress::new(Ipv4Addr::new(10, 0, 0, 7), 32)]
            .into_iter()
            .collect();
        ChainManager::new(&exec)
            .ensure_arp_chain("tap1", &addresses, &snapshot)
            .await
            .unwrap();

        assert_eq!(
            lines(&engine),
            vec![
                "-F neutronARP-tap1",
                "-A neutronARP-tap1 -p ARP --arp-ip-src 10.0.0.7 -j ACCEPT",
            ]
        );
    }

    #[tokio::test]
    async fn test_ensure_mac_chain_chunks_membership() {
        let engine = FakeEbtables::new();
        let exec = executor(&engine);
        let snapshot = exec.snapshot(Table::Nat).await.unwrap();

        ChainManager::new(&exec)
            .ensure_mac_chain("tap1", &generated_macs(1001), &snapshot)
            .await
            .unwrap();

        let rules = engine.rules("nat", "neutronMAC-tap1");
        assert_eq!(rules.len(), 3);
        assert!(rules[2].contains("--among-src fa:16:3e:00:03:e8 "));
    }

    #[tokio::test]
    async fn test_ensure_mac_chain_refuses_empty_set() {
        let engine = FakeEbtables::new();
        engine.seed_commands(
            "nat",
            &listing_fixtures::protected_vif_commands("tap1", "10.0.0.5", "fa:16:3e:00:00:01"),
        );
        let exec = executor(&engine);
        let snapshot = exec.snapshot(Table::Nat).await.unwrap();

        let err = ChainManager::new(&exec)
            .ensure_mac_chain("tap1", &BTreeSet::new(), &snapshot)
            .await
            .unwrap_err();

        assert!(matches!(err, ProtectError::InvalidPolicy { .. }));
        assert!(engine.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_only_what_is_listed() {
        let engine = FakeEbtables::new();
        engine.seed("nat", &["-N", "neutronARP-tap1", "-P", "DROP"]);
        let exec = executor(&engine);
        let snapshot = exec.snapshot(Table::Nat).await.unwrap();

        ChainManager::new(&exec)
            .teardown(&["tap1".to_string(), "tap2".to_string()], &snapshot)
            .await
            .unwrap();

        assert_eq!(lines(&engine), vec!["-X neutronARP-tap1"]);
    }
}
