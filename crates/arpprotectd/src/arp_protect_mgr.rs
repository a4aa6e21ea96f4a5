//! ArpProtectMgr - per-vif anti-spoofing reconciler
//!
//! Every entry point takes the serialization lock, reads the live rule state
//! and converges it toward the requested state. Nothing is cached between
//! calls, so a failed call is repaired by simply calling again.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use arpprotect_common::lock::ProtectionLock;
use arpprotect_common::shell::CommandRunner;
use arpprotect_common::{ProtectError, ProtectResult};

use crate::chains::ChainManager;
use crate::config::ArpProtectConfig;
use crate::executor::EbtablesExecutor;
use crate::snapshot::orphaned_vifs;
use crate::tables::Table;
use crate::types::{collect_ipv4, contains_match_all, ArpAddress, PortPolicy};

/// Reconciles ARP and MAC anti-spoofing chains for vifs.
pub struct ArpProtectMgr {
    executor: EbtablesExecutor,
    lock: ProtectionLock,
    operation_timeout: Option<Duration>,
}

impl ArpProtectMgr {
    /// Creates a manager with no critical-section timeout.
    pub fn new(executor: EbtablesExecutor, lock: ProtectionLock) -> Self {
        Self {
            executor,
            lock,
            operation_timeout: None,
        }
    }

    /// Creates a manager from validated configuration.
    pub fn from_config(config: &ArpProtectConfig, runner: Arc<dyn CommandRunner>) -> ProtectResult<Self> {
        config.validate()?;
        let executor = EbtablesExecutor::new(runner, config.ebtables_settings(), config.retry_policy());
        Ok(Self::new(executor, config.protection_lock()).with_operation_timeout(config.operation_timeout()))
    }

    /// Bounds each locked critical section, lock wait included.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Returns the executor.
    pub fn executor(&self) -> &EbtablesExecutor {
        &self.executor
    }

    /// Returns the serialization lock.
    pub fn lock(&self) -> &ProtectionLock {
        &self.lock
    }

    async fn locked<T, F>(&self, operation: &str, work: F) -> ProtectResult<T>
    where
        F: Future<Output = ProtectResult<T>>,
    {
        let section = async {
            let _guard = self.lock.acquire().await?;
            work.await
        };
        match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, section)
                .await
                .map_err(|_| ProtectError::timeout(operation, limit))?,
            None => section.await,
        }
    }

    /// Converges the protection of `vif` to `policy`.
    ///
    /// Ports with port security disabled, and trusted ports, lose all
    /// protection instead. A protected port needs a well-formed primary MAC;
    /// otherwise nothing is changed.
    #[instrument(skip(self, policy))]
    pub async fn setup_protection(&self, vif: &str, policy: &PortPolicy) -> ProtectResult<()> {
        if !policy.needs_protection() {
            info!(
                vif = %vif,
                port_security = policy.port_security_enabled,
                trusted = policy.is_trusted(),
                "Port needs no protection, removing rules"
            );
            return self.delete_protection(&[vif.to_string()]).await;
        }
        policy.validate(vif)?;

        self.locked("setup_protection", async {
            let snapshot = self.executor.snapshot(Table::Nat).await?;
            let chains = ChainManager::new(&self.executor);

            chains
                .ensure_mac_chain(vif, &policy.allowed_macs(), &snapshot)
                .await?;

            let addresses = policy.ipv4_addresses();
            if contains_match_all(&addresses) {
                info!(vif = %vif, "Allowed address covers everything, skipping ARP protection");
                return Ok(());
            }
            chains.ensure_arp_chain(vif, &addresses, &snapshot).await
        })
        .await
    }

    /// Installs ARP protection only, accepting exactly `addresses`.
    ///
    /// Non-IPv4 entries are dropped; a /0 among them leaves the rules untouched.
    #[instrument(skip(self, addresses))]
    pub async fn install_protection(&self, vif: &str, addresses: &BTreeSet<String>) -> ProtectResult<()> {
        let addresses: BTreeSet<ArpAddress> = collect_ipv4(addresses);
        if contains_match_all(&addresses) {
            info!(vif = %vif, "Allowed address covers everything, skipping ARP protection");
            return Ok(());
        }

        self.locked("install_protection", async {
            let snapshot = self.executor.snapshot(Table::Nat).await?;
            ChainManager::new(&self.executor)
                .ensure_arp_chain(vif, &addresses, &snapshot)
                .await
        })
        .await
    }

    /// Removes every managed jump and chain of `vifs`, current and legacy.
    #[instrument(skip(self))]
    pub async fn delete_protection(&self, vifs: &[String]) -> ProtectResult<()> {
        self.locked("delete_protection", async {
            let chains = ChainManager::new(&self.executor);
            for table in Table::ALL {
                let snapshot = self.executor.snapshot(table).await?;
                chains.teardown(vifs, &snapshot).await?;
            }
            Ok(())
        })
        .await
    }

    /// Removes protection of every managed vif not in `current_vifs`.
    #[instrument(skip(self, current_vifs), fields(current = current_vifs.len()))]
    pub async fn delete_unreferenced_protection(&self, current_vifs: &BTreeSet<String>) -> ProtectResult<()> {
        self.locked("delete_unreferenced_protection", async {
            let chains = ChainManager::new(&self.executor);
            for table in Table::ALL {
                let snapshot = self.executor.snapshot(table).await?;
                let orphans = orphaned_vifs(&snapshot, current_vifs);
                if orphans.is_empty() {
                    debug!(table = %table, "No orphaned protection");
                    continue;
                }
                info!(table = %table, orphans = ?orphans, "Removing orphaned protection");
                chains.teardown(&orphans, &snapshot).await?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EbtablesSettings;
    use arpprotect_common::RetryPolicy;
    use arpprotect_test::{listing_fixtures, EngineVerifier, FakeEbtables};
    use pretty_assertions::assert_eq;

    fn manager(engine: &FakeEbtables, lock_name: &str) -> ArpProtectMgr {
        let executor = EbtablesExecutor::new(
            Arc::new(engine.clone()),
            EbtablesSettings::default(),
            RetryPolicy::default(),
        );
        ArpProtectMgr::new(executor, ProtectionLock::process_wide(lock_name))
    }

    fn policy() -> PortPolicy {
        PortPolicy::new("fa:16:3e:00:00:01")
            .with_fixed_ip("10.0.0.5")
            .with_allowed_pair("10.0.0.2", "fa:16:3e:00:00:02")
    }

    #[tokio::test]
    async fn test_setup_installs_both_chains() {
        let engine = FakeEbtables::new();
        let mgr = manager(&engine, "mgr-setup");

        mgr.setup_protection("tap1", &policy()).await.unwrap();

        let verifier = EngineVerifier::new(&engine);
        verifier.assert_vif_protected("tap1").unwrap();
        assert_eq!(verifier.arp_sources("tap1"), vec!["10.0.0.2", "10.0.0.5"]);
        assert_eq!(verifier.membership_sizes("tap1"), vec![2]);
    }

    #[tokio::test]
    async fn test_setup_mac_before_arp() {
        let engine = FakeEbtables::new();
        let mgr = manager(&engine, "mgr-order");

        mgr.setup_protection("tap1", &policy()).await.unwrap();

        let ops: Vec<String> = engine.history().iter().map(|c| c.line()).collect();
        assert_eq!(
            ops,
            vec![
                "-L",
                "-N neutronMAC-tap1 -P DROP",
                "-A PREROUTING -i tap1 -j neutronMAC-tap1",
                "-A neutronMAC-tap1 -i tap1 --among-src fa:16:3e:00:00:01,fa:16:3e:00:00:02 -j RETURN",
                "-N neutronARP-tap1 -P DROP",
                "-F neutronARP-tap1",
                "-A neutronARP-tap1 -p ARP --arp-ip-src 10.0.0.2 -j ACCEPT",
                "-A neutronARP-tap1 -p ARP --arp-ip-src 10.0.0.5 -j ACCEPT",
                "-A PREROUTING -i tap1 -j neutronARP-tap1 -p ARP",
            ]
        );
    }

    #[tokio::test]
    async fn test_trusted_port_is_cleaned() {
        let engine = FakeEbtables::new();
        engine.seed_commands(
            "nat",
            &listing_fixtures::protected_vif_commands("tap1", "10.0.0.5", "fa:16:3e:00:00:01"),
        );
        let mgr = manager(&engine, "mgr-trusted");

        let mut policy = policy();
        policy.device_owner = Some("network:router_interface".to_string());
        mgr.setup_protection("tap1", &policy).await.unwrap();

        EngineVerifier::new(&engine).assert_vif_clean("tap1").unwrap();
    }

    #[tokio::test]
    async fn test_install_protection_arp_only() {
        let engine = FakeEbtables::new();
        let mgr = manager(&engine, "mgr-install");

        let addresses: BTreeSet<String> = ["10.0.0.9", "fe80::1", "10.0.0.3"]
            .into_iter()
            .map(String::from)
            .collect();
        mgr.install_protection("tap1", &addresses).await.unwrap();

        let verifier = EngineVerifier::new(&engine);
        verifier.assert_arp_protected("tap1").unwrap();
        assert!(!engine.has_chain("nat", "neutronMAC-tap1"));
        assert_eq!(verifier.arp_sources("tap1"), vec!["10.0.0.3", "10.0.0.9"]);
    }

    #[tokio::test]
    async fn test_install_protection_match_all_is_noop() {
        let engine = FakeEbtables::new();
        let mgr = manager(&engine, "mgr-install-all");

        let addresses: BTreeSet<String> = ["10.0.0.9", "0.0.0.0/0"].into_iter().map(String::from).collect();
        mgr.install_protection("tap1", &addresses).await.unwrap();

        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn test_delete_on_clean_state_only_lists() {
        let engine = FakeEbtables::new();
        let mgr = manager(&engine, "mgr-delete-clean");

        mgr.delete_protection(&["tap1".to_string()]).await.unwrap();

        assert!(engine.mutations().is_empty());
        let tables: Vec<String> = engine.history().iter().map(|c| c.table.clone()).collect();
        assert_eq!(tables, vec!["nat", "filter"]);
    }

    #[tokio::test]
    async fn test_operation_timeout() {
        let engine = FakeEbtables::new().with_latency(Duration::from_millis(200));
        let mgr = manager(&engine, "mgr-timeout").with_operation_timeout(Some(Duration::from_millis(50)));

        let err = mgr.delete_protection(&["tap1".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProtectError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid() {
        let engine = FakeEbtables::new();
        let mut config = ArpProtectConfig::default();
        config.ebtables.binary = String::new();

        let result = ArpProtectMgr::from_config(&config, Arc::new(engine));
        assert!(matches!(result, Err(ProtectError::InvalidConfig { .. })));
    }
}
