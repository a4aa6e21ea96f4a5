//! In-memory ebtables engine
//!
//! [`FakeEbtables`] implements `CommandRunner` and understands the command
//! shapes the reconciler issues (`-L`, `-N`, `-F`, `-A`, `-D`, `-X`). It keeps
//! one set of chains per table, renders `-L` in ebtables' listing format and
//! records every invocation. Failures can be injected to exercise the retry
//! and error paths.
//!
//! Rules are stored exactly as appended and `-D` removes the first rule whose
//! tokens are equal, as ebtables does.

use arpprotect_common::shell::{CommandRunner, ExecResult};
use arpprotect_common::ProtectResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// ebtables' limit on chain name length.
pub const MAX_CHAIN_NAME_LEN: usize = 31;

/// Exit code for ordinary command errors.
pub const ERROR_EXIT_CODE: i32 = 1;

const STANDARD_TARGETS: [&str; 4] = ["ACCEPT", "DROP", "RETURN", "CONTINUE"];

/// One invocation seen by the fake engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    /// Table selected with `-t`.
    pub table: String,
    /// Arguments after the table selection and `--concurrent`.
    pub args: Vec<String>,
    /// Exit code returned to the caller.
    pub exit_code: i32,
}

impl RecordedCommand {
    /// Arguments joined by spaces.
    pub fn line(&self) -> String {
        self.args.join(" ")
    }

    /// The operation flag, e.g. `-A`.
    pub fn op(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// True if this command changed (or tried to change) state.
    pub fn is_mutation(&self) -> bool {
        self.op() != "-L"
    }

    /// True if any argument equals `token` or names a chain ending in it.
    pub fn mentions_vif(&self, vif: &str) -> bool {
        self.args
            .iter()
            .any(|a| a == vif || a.strip_suffix(vif).is_some_and(|p| p.ends_with('-')))
    }
}

#[derive(Debug, Clone)]
struct FakeChain {
    name: String,
    policy: String,
    builtin: bool,
    rules: Vec<Vec<String>>,
}

impl FakeChain {
    fn new(name: &str, policy: &str, builtin: bool) -> Self {
        Self {
            name: name.to_string(),
            policy: policy.to_string(),
            builtin,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct FakeTable {
    chains: Vec<FakeChain>,
}

impl FakeTable {
    fn with_builtins(builtins: &[&str]) -> Self {
        Self {
            chains: builtins
                .iter()
                .map(|name| FakeChain::new(name, "ACCEPT", true))
                .collect(),
        }
    }

    fn chain(&self, name: &str) -> Option<&FakeChain> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn chain_mut(&mut self, name: &str) -> Option<&mut FakeChain> {
        self.chains.iter_mut().find(|c| c.name == name)
    }

    fn is_referenced(&self, name: &str) -> bool {
        self.chains.iter().flat_map(|c| c.rules.iter()).any(|rule| {
            rule.windows(2)
                .any(|w| w[0] == "-j" && w[1] == name)
        })
    }

    fn render(&self, table: &str) -> String {
        let mut out = format!("Bridge table: {table}\n\n");
        for chain in &self.chains {
            out.push_str(&format!(
                "Bridge chain: {}, entries: {}, policy: {}\n",
                chain.name,
                chain.rules.len(),
                chain.policy
            ));
            for rule in &chain.rules {
                out.push_str(&rule.join(" "));
                out.push_str(" \n");
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Debug)]
struct EngineState {
    tables: BTreeMap<String, FakeTable>,
    history: Vec<RecordedCommand>,
    scripted_exits: VecDeque<i32>,
    failing_tokens: Vec<(String, i32)>,
    latency: Option<Duration>,
}

impl Default for EngineState {
    fn default() -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(
            "nat".to_string(),
            FakeTable::with_builtins(&["PREROUTING", "OUTPUT", "POSTROUTING"]),
        );
        tables.insert(
            "filter".to_string(),
            FakeTable::with_builtins(&["INPUT", "FORWARD", "OUTPUT"]),
        );
        Self {
            tables,
            history: Vec::new(),
            scripted_exits: VecDeque::new(),
            failing_tokens: Vec::new(),
            latency: None,
        }
    }
}

fn fail(msg: impl Into<String>) -> ExecResult {
    ExecResult::failed(ERROR_EXIT_CODE, msg)
}

/// Splits an argv into `(table, ebtables args)`, skipping privilege and
/// namespace prefixes.
fn split_argv(argv: &[String]) -> (String, Vec<String>) {
    let start = argv
        .iter()
        .position(|a| a == "-t")
        .unwrap_or_else(|| argv.len().min(1));
    let (table, rest) = if argv.get(start).is_some_and(|a| a == "-t") {
        (
            argv.get(start + 1).cloned().unwrap_or_default(),
            &argv[(start + 2).min(argv.len())..],
        )
    } else {
        ("filter".to_string(), &argv[start..])
    };
    let args = rest
        .iter()
        .filter(|a| a.as_str() != "--concurrent")
        .cloned()
        .collect();
    (table, args)
}

impl EngineState {
    fn execute(&mut self, argv: &[String]) -> ExecResult {
        let (table, args) = split_argv(argv);
        let result = self.apply(&table, &args);
        self.history.push(RecordedCommand {
            table,
            args,
            exit_code: result.exit_code,
        });
        result
    }

    fn apply(&mut self, table: &str, args: &[String]) -> ExecResult {
        if let Some(code) = self.scripted_exits.pop_front() {
            return ExecResult::failed(code, "injected failure");
        }
        if let Some((_, code)) = self
            .failing_tokens
            .iter()
            .find(|(token, _)| args.iter().any(|a| a == token))
        {
            return ExecResult::failed(*code, "injected failure");
        }

        let Some(tbl) = self.tables.get_mut(table) else {
            return fail(format!("Table '{table}' does not exist"));
        };
        let Some((op, rest)) = args.split_first() else {
            return fail("No command specified");
        };

        match op.as_str() {
            "-L" => ExecResult::ok(tbl.render(table)),
            "-N" => {
                let Some(name) = rest.first() else {
                    return fail("-N requires a chain name");
                };
                if name.len() > MAX_CHAIN_NAME_LEN {
                    return fail(format!("Chain name '{name}' is too long"));
                }
                if tbl.chain(name).is_some() {
                    return fail(format!("Chain '{name}' already exists"));
                }
                let policy = rest
                    .windows(2)
                    .find(|w| w[0] == "-P")
                    .map_or("ACCEPT", |w| w[1].as_str());
                tbl.chains.push(FakeChain::new(name, policy, false));
                ExecResult::ok("")
            }
            "-F" => match rest.first().and_then(|name| tbl.chain_mut(name)) {
                Some(chain) => {
                    chain.rules.clear();
                    ExecResult::ok("")
                }
                None => fail("Chain does not exist"),
            },
            "-A" => {
                let Some((name, rule)) = rest.split_first() else {
                    return fail("-A requires a chain name");
                };
                let target = rule.windows(2).find(|w| w[0] == "-j").map(|w| w[1].clone());
                if let Some(target) = target {
                    if !STANDARD_TARGETS.contains(&target.as_str()) && tbl.chain(&target).is_none()
                    {
                        return fail(format!("Target '{target}' does not exist"));
                    }
                }
                match tbl.chain_mut(name) {
                    Some(chain) => {
                        chain.rules.push(rule.to_vec());
                        ExecResult::ok("")
                    }
                    None => fail(format!("Chain '{name}' does not exist")),
                }
            }
            "-D" => {
                let Some((name, rule)) = rest.split_first() else {
                    return fail("-D requires a chain name");
                };
                let Some(chain) = tbl.chain_mut(name) else {
                    return fail(format!("Chain '{name}' does not exist"));
                };
                match chain.rules.iter().position(|r| r.as_slice() == rule) {
                    Some(idx) => {
                        chain.rules.remove(idx);
                        ExecResult::ok("")
                    }
                    None => fail("Illegal target name / rule not found"),
                }
            }
            "-X" => {
                let Some(name) = rest.first() else {
                    return fail("-X requires a chain name");
                };
                match tbl.chain(name) {
                    None => return fail(format!("Chain '{name}' does not exist")),
                    Some(chain) if chain.builtin => {
                        return fail(format!("Cannot delete builtin chain '{name}'"))
                    }
                    Some(_) => {}
                }
                if tbl.is_referenced(name) {
                    return fail(format!("Chain '{name}' is referenced"));
                }
                tbl.chains.retain(|c| &c.name != name);
                ExecResult::ok("")
            }
            other => fail(format!("Unsupported command '{other}'")),
        }
    }
}

/// Shared handle to an in-memory rule engine.
///
/// Clones share state, so a test keeps one handle for inspection and gives
/// another to the code under test.
#[derive(Debug, Clone, Default)]
pub struct FakeEbtables {
    state: Arc<Mutex<EngineState>>,
}

impl FakeEbtables {
    /// Creates an engine with empty `nat` and `filter` tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps this long before executing each command.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    /// The next commands fail with these exit codes, in order.
    pub fn push_exit_codes(&self, codes: &[i32]) {
        self.state.lock().scripted_exits.extend(codes.iter().copied());
    }

    /// Every command containing `token` as an argument fails with `exit_code`.
    pub fn fail_on(&self, token: impl Into<String>, exit_code: i32) {
        self.state.lock().failing_tokens.push((token.into(), exit_code));
    }

    /// Removes injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.scripted_exits.clear();
        state.failing_tokens.clear();
    }

    /// Runs ebtables args directly against `table`, bypassing injection.
    ///
    /// Used to seed state, e.g. `seed("filter", &["-N", "neutronARP-old", "-P", "DROP"])`.
    pub fn seed(&self, table: &str, args: &[&str]) -> ExecResult {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.state.lock().apply(table, &args)
    }

    /// Seeds a sequence of commands, e.g. from `listing_fixtures`.
    pub fn seed_commands(&self, table: &str, cmds: &[Vec<String>]) {
        let mut state = self.state.lock();
        for cmd in cmds {
            let result = state.apply(table, cmd);
            debug_assert!(result.success(), "seed failed: {cmd:?}: {}", result.stderr);
        }
    }

    /// `-L` output for `table`, or an empty string if unknown.
    pub fn listing(&self, table: &str) -> String {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.render(table))
            .unwrap_or_default()
    }

    /// Chain names of `table`, in listing order.
    pub fn chain_names(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.chains.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns true if `chain` exists in `table`.
    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .tables
            .get(table)
            .is_some_and(|t| t.chain(chain).is_some())
    }

    /// Default policy of `chain`.
    pub fn policy(&self, table: &str, chain: &str) -> Option<String> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.chain(chain))
            .map(|c| c.policy.clone())
    }

    /// Rules of `chain`, each joined by spaces.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.chain(chain))
            .map(|c| c.rules.iter().map(|r| r.join(" ")).collect())
            .unwrap_or_default()
    }

    /// Every command seen so far, including failed attempts.
    pub fn history(&self) -> Vec<RecordedCommand> {
        self.state.lock().history.clone()
    }

    /// Successful commands that changed state.
    pub fn mutations(&self) -> Vec<RecordedCommand> {
        self.history()
            .into_iter()
            .filter(|c| c.exit_code == 0 && c.is_mutation())
            .collect()
    }

    /// Forgets recorded history; tables are kept.
    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }
}

#[async_trait]
impl CommandRunner for FakeEbtables {
    async fn run(&self, argv: &[String]) -> ProtectResult<ExecResult> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let result = self.state.lock().execute(argv);
        tracing::trace!(exit_code = result.exit_code, "fake ebtables");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn run(engine: &FakeEbtables, parts: &[&str]) -> ExecResult {
        engine.run(&argv(parts)).await.unwrap()
    }

    #[tokio::test]
    async fn test_strips_prefixes() {
        let engine = FakeEbtables::new();
        let result = run(
            &engine,
            &["sudo", "/sbin/ip", "netns", "exec", "ns1", "ebtables", "-t", "nat", "--concurrent", "-N", "c1", "-P", "DROP"],
        )
        .await;
        assert!(result.success());
        assert_eq!(engine.history()[0].table, "nat");
        assert_eq!(engine.history()[0].line(), "-N c1 -P DROP");
        assert_eq!(engine.policy("nat", "c1").as_deref(), Some("DROP"));
    }

    #[tokio::test]
    async fn test_listing_format() {
        let engine = FakeEbtables::new();
        engine.seed("nat", &["-N", "neutronARP-tap1", "-P", "DROP"]);
        engine.seed(
            "nat",
            &["-A", "neutronARP-tap1", "-p", "ARP", "--arp-ip-src", "10.0.0.5", "-j", "ACCEPT"],
        );
        let listing = engine.listing("nat");
        assert!(listing.starts_with("Bridge table: nat\n"));
        assert!(listing.contains("Bridge chain: PREROUTING, entries: 0, policy: ACCEPT\n"));
        assert!(listing.contains("Bridge chain: neutronARP-tap1, entries: 1, policy: DROP\n"));
        assert!(listing.contains("-p ARP --arp-ip-src 10.0.0.5 -j ACCEPT \n"));
    }

    #[test]
    fn test_empty_tables_render_like_ebtables() {
        let engine = FakeEbtables::new();
        assert_eq!(
            engine.listing("nat").trim_end(),
            crate::fixtures::listing_fixtures::EMPTY_NAT.trim_end()
        );
    }

    #[tokio::test]
    async fn test_delete_removes_first_match() {
        let engine = FakeEbtables::new();
        engine.seed("nat", &["-N", "c1"]);
        engine.seed("nat", &["-A", "c1", "-i", "tap1", "-j", "RETURN"]);
        engine.seed("nat", &["-A", "c1", "-i", "tap2", "-j", "RETURN"]);
        engine.seed("nat", &["-A", "c1", "-i", "tap1", "-j", "RETURN"]);

        let result = run(&engine, &["ebtables", "-t", "nat", "-D", "c1", "-i", "tap1", "-j", "RETURN"]).await;
        assert!(result.success());
        assert_eq!(
            engine.rules("nat", "c1"),
            vec!["-i tap2 -j RETURN", "-i tap1 -j RETURN"]
        );
    }

    #[tokio::test]
    async fn test_delete_referenced_chain_fails() {
        let engine = FakeEbtables::new();
        engine.seed("nat", &["-N", "c1"]);
        engine.seed("nat", &["-A", "PREROUTING", "-i", "tap1", "-j", "c1"]);

        let result = run(&engine, &["ebtables", "-t", "nat", "-X", "c1"]).await;
        assert_eq!(result.exit_code, ERROR_EXIT_CODE);
        assert!(engine.has_chain("nat", "c1"));
    }

    #[tokio::test]
    async fn test_append_to_missing_target_fails() {
        let engine = FakeEbtables::new();
        let result = run(&engine, &["ebtables", "-t", "nat", "-A", "PREROUTING", "-j", "nope"]).await;
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_scripted_exit_codes() {
        let engine = FakeEbtables::new();
        engine.push_exit_codes(&[255]);
        assert_eq!(run(&engine, &["ebtables", "-t", "nat", "-L"]).await.exit_code, 255);
        assert!(run(&engine, &["ebtables", "-t", "nat", "-L"]).await.success());
    }

    #[tokio::test]
    async fn test_fail_on_token() {
        let engine = FakeEbtables::new();
        engine.fail_on("-X", 4);
        engine.seed("nat", &["-N", "c1"]);
        assert_eq!(run(&engine, &["ebtables", "-t", "nat", "-X", "c1"]).await.exit_code, 4);
        engine.clear_failures();
        assert!(run(&engine, &["ebtables", "-t", "nat", "-X", "c1"]).await.success());
    }

    #[test]
    fn test_recorded_command_mentions_vif() {
        let cmd = RecordedCommand {
            table: "nat".to_string(),
            args: argv(&["-F", "neutronARP-tap1"]),
            exit_code: 0,
        };
        assert!(cmd.mentions_vif("tap1"));
        assert!(!cmd.mentions_vif("ap1"));
        assert!(!cmd.mentions_vif("tap10"));
    }
}
