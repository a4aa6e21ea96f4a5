//! arpprotectd - ARP/MAC anti-spoofing operator tool
//!
//! Runs one reconciliation against the local ebtables and exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use arpprotect_common::ProcessRunner;
use arpprotectd::config::DEFAULT_CONFIG_PATH;
use arpprotectd::{ArpProtectConfig, ArpProtectMgr, PortPolicy};

/// Per-interface ARP and MAC anti-spoofing for ebtables
#[derive(Parser, Debug)]
#[command(name = "arpprotectd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Network namespace, overriding the configuration file
    #[arg(short = 'n', long)]
    namespace: Option<String>,

    /// Log level if RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge the protection of one vif to a port policy
    Setup {
        /// Interface to protect
        #[arg(long)]
        vif: String,

        /// Port policy as a JSON file
        #[arg(long)]
        policy: PathBuf,
    },

    /// Remove every managed rule of the given vifs
    Delete {
        /// Interfaces to clean up
        #[arg(required = true)]
        vifs: Vec<String>,
    },

    /// Remove protection of every managed vif not listed
    Sweep {
        /// Interfaces that still exist
        #[arg(long = "current", num_args = 0..)]
        current: Vec<String>,
    },

    /// Install ARP protection for the given addresses only
    Install {
        /// Interface to protect
        #[arg(long)]
        vif: String,

        /// IPv4 addresses or networks to accept
        addresses: Vec<String>,
    },
}

/// Initializes tracing/logging subsystem
fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn load_policy(path: &Path) -> Result<PortPolicy> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse policy file {}", path.display()))
}

async fn run(args: Args) -> Result<()> {
    let mut config = ArpProtectConfig::load_or_default(&args.config)?;
    if args.namespace.is_some() {
        config.ebtables.namespace = args.namespace;
    }

    let mgr = ArpProtectMgr::from_config(&config, Arc::new(ProcessRunner))?;

    match args.command {
        Command::Setup { vif, policy } => {
            let policy = load_policy(&policy)?;
            mgr.setup_protection(&vif, &policy).await?;
            info!(vif = %vif, "Protection converged");
        }
        Command::Delete { vifs } => {
            mgr.delete_protection(&vifs).await?;
            info!(count = vifs.len(), "Protection removed");
        }
        Command::Sweep { current } => {
            let current: BTreeSet<String> = current.into_iter().collect();
            mgr.delete_unreferenced_protection(&current).await?;
            info!(current = current.len(), "Sweep complete");
        }
        Command::Install { vif, addresses } => {
            let addresses: BTreeSet<String> = addresses.into_iter().collect();
            mgr.install_protection(&vif, &addresses).await?;
            info!(vif = %vif, "ARP protection installed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("arpprotectd failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
