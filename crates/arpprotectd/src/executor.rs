//! ebtables command executor
//!
//! Wraps a [`CommandRunner`] with everything every ebtables invocation
//! shares: privilege escalation, namespace scoping, table selection, the
//! `--concurrent` flag and the busy-status retry policy.

use std::sync::Arc;
use tracing::debug;

use arpprotect_common::retry::{exec_with_retry, RetryPolicy};
use arpprotect_common::shell::{command_line, CommandRunner, EBTABLES_CMD, IP_CMD, SUDO_CMD};
use arpprotect_common::ProtectResult;

use crate::commands::build_list_cmd;
use crate::snapshot::RuleSnapshot;
use crate::tables::Table;

/// How ebtables is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EbtablesSettings {
    /// Rule engine binary.
    pub binary: String,
    /// Privilege helper prepended to every command; empty when already root.
    pub root_helper: Vec<String>,
    /// Network namespace to run in; `None` for the current one.
    pub namespace: Option<String>,
}

impl Default for EbtablesSettings {
    fn default() -> Self {
        Self {
            binary: EBTABLES_CMD.to_string(),
            root_helper: vec![SUDO_CMD.to_string()],
            namespace: None,
        }
    }
}

/// Runs ebtables commands against one table at a time.
#[derive(Clone)]
pub struct EbtablesExecutor {
    runner: Arc<dyn CommandRunner>,
    settings: EbtablesSettings,
    retry: RetryPolicy,
}

impl EbtablesExecutor {
    /// Creates an executor.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: EbtablesSettings, retry: RetryPolicy) -> Self {
        Self {
            runner,
            settings,
            retry,
        }
    }

    /// Returns the invocation settings.
    pub fn settings(&self) -> &EbtablesSettings {
        &self.settings
    }

    /// Full argument vector for `args` against `table`.
    pub fn argv(&self, table: Table, args: &[String]) -> Vec<String> {
        let mut argv = self.settings.root_helper.clone();
        if let Some(ns) = &self.settings.namespace {
            argv.extend([IP_CMD, "netns", "exec", ns.as_str()].map(str::to_string));
        }
        argv.extend([self.settings.binary.as_str(), "-t", table.name(), "--concurrent"].map(str::to_string));
        argv.extend(args.iter().cloned());
        argv
    }

    /// Runs one command, retrying while the engine reports busy.
    ///
    /// Returns the command's stdout.
    pub async fn run(&self, table: Table, args: &[String]) -> ProtectResult<String> {
        let argv = self.argv(table, args);
        debug!(command = %command_line(&argv), "ebtables");
        exec_with_retry(self.runner.as_ref(), &argv, &self.retry).await
    }

    /// Reads the live state of `table`.
    pub async fn snapshot(&self, table: Table) -> ProtectResult<RuleSnapshot> {
        let listing = self.run(table, &build_list_cmd()).await?;
        Ok(RuleSnapshot::parse(table, &listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arpprotect_common::ProcessRunner;

    fn executor(settings: EbtablesSettings) -> EbtablesExecutor {
        EbtablesExecutor::new(Arc::new(ProcessRunner), settings, RetryPolicy::default())
    }

    #[test]
    fn test_argv_default() {
        let exec = executor(EbtablesSettings::default());
        let argv = exec.argv(Table::Nat, &build_list_cmd());
        assert_eq!(argv, vec!["sudo", "ebtables", "-t", "nat", "--concurrent", "-L"]);
    }

    #[test]
    fn test_argv_namespace_and_no_helper() {
        let exec = executor(EbtablesSettings {
            root_helper: Vec::new(),
            namespace: Some("qtest".to_string()),
            ..EbtablesSettings::default()
        });
        let argv = exec.argv(Table::Filter, &["-X".to_string(), "neutronARP-tap1".to_string()]);
        assert_eq!(
            argv,
            vec![
                "/sbin/ip",
                "netns",
                "exec",
                "qtest",
                "ebtables",
                "-t",
                "filter",
                "--concurrent",
                "-X",
                "neutronARP-tap1",
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_parses_runner_output() {
        // `echo` stands in for ebtables and prints its arguments back.
        let exec = executor(EbtablesSettings {
            binary: "echo".to_string(),
            root_helper: Vec::new(),
            namespace: None,
        });
        let snap = exec.snapshot(Table::Nat).await.unwrap();
        assert_eq!(snap.lines(), ["-t nat --concurrent -L"]);
        assert!(snap.chains().is_empty());
    }
}
