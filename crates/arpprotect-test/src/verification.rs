//! Verification helpers for testing the reconciler
//!
//! Provides assertion helpers over the fake engine's tables and its
//! recorded command history.

use crate::fake_engine::{FakeEbtables, RecordedCommand};
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected chain '{chain}' in table '{table}'")]
    ChainMissing { table: String, chain: String },

    #[error("Unexpected chain '{chain}' in table '{table}'")]
    UnexpectedChain { table: String, chain: String },

    #[error("Expected {expected} jump(s) from '{chain}' for '{vif}', found {actual}")]
    JumpCountMismatch {
        chain: String,
        vif: String,
        expected: usize,
        actual: usize,
    },

    #[error("Value mismatch for {what}: expected '{expected}', got '{actual}'")]
    ValueMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("Expected {expected} commands matching '{pattern}', found {actual}")]
    CommandCountMismatch {
        pattern: String,
        expected: usize,
        actual: usize,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

const ARP_PREFIX: &str = "neutronARP-";
const MAC_PREFIX: &str = "neutronMAC-";

/// Rule-state verification helper
pub struct EngineVerifier<'a> {
    engine: &'a FakeEbtables,
}

impl<'a> EngineVerifier<'a> {
    /// Create a new verifier over `engine`
    pub fn new(engine: &'a FakeEbtables) -> Self {
        Self { engine }
    }

    fn jumps(&self, table: &str, jump_chain: &str, vif: &str, target: &str) -> usize {
        self.engine
            .rules(table, jump_chain)
            .iter()
            .filter(|rule| {
                let tokens: Vec<&str> = rule.split_whitespace().collect();
                tokens.windows(2).any(|w| w == ["-i", vif])
                    && tokens.windows(2).any(|w| w == ["-j", target])
            })
            .count()
    }

    fn expect_chain(&self, table: &str, chain: &str) -> VerifyResult<()> {
        if !self.engine.has_chain(table, chain) {
            return Err(VerificationError::ChainMissing {
                table: table.to_string(),
                chain: chain.to_string(),
            });
        }
        let policy = self.engine.policy(table, chain).unwrap_or_default();
        if policy != "DROP" {
            return Err(VerificationError::ValueMismatch {
                what: format!("policy of {chain}"),
                expected: "DROP".to_string(),
                actual: policy,
            });
        }
        Ok(())
    }

    fn expect_jumps(&self, table: &str, jump_chain: &str, vif: &str, target: &str, expected: usize) -> VerifyResult<()> {
        let actual = self.jumps(table, jump_chain, vif, target);
        if actual != expected {
            return Err(VerificationError::JumpCountMismatch {
                chain: jump_chain.to_string(),
                vif: vif.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Verify `vif` has its MAC chain, DROP policy, and exactly one jump to it
    pub fn assert_mac_protected(&self, vif: &str) -> VerifyResult<()> {
        let chain = format!("{MAC_PREFIX}{vif}");
        self.expect_chain("nat", &chain)?;
        self.expect_jumps("nat", "PREROUTING", vif, &chain, 1)
    }

    /// Verify `vif` has its ARP chain, DROP policy, and exactly one ARP jump to it
    pub fn assert_arp_protected(&self, vif: &str) -> VerifyResult<()> {
        let chain = format!("{ARP_PREFIX}{vif}");
        self.expect_chain("nat", &chain)?;
        self.expect_jumps("nat", "PREROUTING", vif, &chain, 1)?;
        let with_proto = self
            .engine
            .rules("nat", "PREROUTING")
            .iter()
            .filter(|r| r.contains(&format!("-j {chain}")) && r.contains("-p ARP"))
            .count();
        if with_proto != 1 {
            return Err(VerificationError::ValueMismatch {
                what: format!("protocol filter of jump to {chain}"),
                expected: "-p ARP".to_string(),
                actual: format!("{with_proto} matching rules"),
            });
        }
        Ok(())
    }

    /// Verify `vif` is fully protected
    pub fn assert_vif_protected(&self, vif: &str) -> VerifyResult<()> {
        self.assert_mac_protected(vif)?;
        self.assert_arp_protected(vif)
    }

    /// Verify no managed chain or jump for `vif` remains in any table
    pub fn assert_vif_clean(&self, vif: &str) -> VerifyResult<()> {
        for (table, jump_chain) in [("nat", "PREROUTING"), ("filter", "FORWARD")] {
            for prefix in [ARP_PREFIX, MAC_PREFIX] {
                let chain = format!("{prefix}{vif}");
                if self.engine.has_chain(table, &chain) {
                    return Err(VerificationError::UnexpectedChain {
                        table: table.to_string(),
                        chain,
                    });
                }
                self.expect_jumps(table, jump_chain, vif, &chain, 0)?;
            }
        }
        Ok(())
    }

    /// ARP source addresses accepted for `vif`, in rule order
    pub fn arp_sources(&self, vif: &str) -> Vec<String> {
        self.engine
            .rules("nat", &format!("{ARP_PREFIX}{vif}"))
            .iter()
            .filter_map(|rule| {
                let tokens: Vec<&str> = rule.split_whitespace().collect();
                tokens
                    .windows(2)
                    .find(|w| w[0] == "--arp-ip-src")
                    .map(|w| w[1].to_string())
            })
            .collect()
    }

    /// Number of MACs in each membership rule of `vif`, in rule order
    pub fn membership_sizes(&self, vif: &str) -> Vec<usize> {
        self.engine
            .rules("nat", &format!("{MAC_PREFIX}{vif}"))
            .iter()
            .filter_map(|rule| {
                let tokens: Vec<&str> = rule.split_whitespace().collect();
                tokens
                    .windows(2)
                    .find(|w| w[0] == "--among-src")
                    .map(|w| w[1].split(',').filter(|m| !m.is_empty()).count())
            })
            .collect()
    }
}

/// Command history verifier
pub struct CommandVerifier {
    commands: Vec<RecordedCommand>,
}

impl CommandVerifier {
    /// Create a verifier over recorded commands
    pub fn new(commands: Vec<RecordedCommand>) -> Self {
        Self { commands }
    }

    /// Count commands whose joined arguments contain `pattern`
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.commands
            .iter()
            .filter(|c| c.line().contains(pattern))
            .count()
    }

    /// Verify that a matching command was executed
    pub fn assert_command_executed(&self, pattern: &str) -> VerifyResult<()> {
        if self.count_matching(pattern) > 0 {
            Ok(())
        } else {
            Err(VerificationError::CommandCountMismatch {
                pattern: pattern.to_string(),
                expected: 1,
                actual: 0,
            })
        }
    }

    /// Verify that no matching command was executed
    pub fn assert_command_not_executed(&self, pattern: &str) -> VerifyResult<()> {
        let actual = self.count_matching(pattern);
        if actual == 0 {
            Ok(())
        } else {
            Err(VerificationError::CommandCountMismatch {
                pattern: pattern.to_string(),
                expected: 0,
                actual,
            })
        }
    }

    /// Verify the total number of commands
    pub fn assert_command_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.commands.len();
        if actual != expected {
            return Err(VerificationError::CommandCountMismatch {
                pattern: "*".to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Get all recorded commands
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }
}
