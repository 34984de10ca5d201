//! regfix: provision regtest multisig wallet fixtures
//!
//! Creates signer and watcher wallets on a regtest bitcoind, generates the
//! transaction history of each wallet-health scenario and writes one
//! Caravan-style wallet configuration per scenario.
//!
//! # Usage
//!
//! ```bash
//! regfix --config regfix.toml
//! regfix --scenario bad_privacy --scenario good_waste
//! regfix --list
//! regfix --validate
//! ```

mod config;
mod runner;

use anyhow::{Context, Result};
use regfix_core::Scenario;
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = "regfix.toml";

fn main() -> Result<()> {
    // Parse CLI args (minimal, hand-rolled)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut scenarios: Vec<Scenario> = Vec::new();
    let mut force = false;
    let mut list_only = false;
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--scenario" | "-s" => {
                i += 1;
                if i < args.len() {
                    let scenario: Scenario = args[i].parse()?;
                    if !scenarios.contains(&scenario) {
                        scenarios.push(scenario);
                    }
                } else {
                    anyhow::bail!("--scenario requires a name");
                }
            }
            "--force" | "-f" => {
                force = true;
            }
            "--list" => {
                list_only = true;
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("regfix {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    // An explicit --config must exist; the default path is optional
    let mut regfix_config = match &config_path {
        Some(path) => config::RegfixConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => config::RegfixConfig::from_file_or_default(&PathBuf::from(DEFAULT_CONFIG))?,
    };

    regfix_config.apply_env_overrides();

    regfix_config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger
    std::env::set_var("RUST_LOG", &regfix_config.logging.level);
    env_logger::init();

    if validate_only {
        println!("Configuration is valid.");
        println!("  Node:          {}", regfix_config.node_url());
        println!("  RPC user:      {}", regfix_config.node.user);
        println!(
            "  Output dir:    {}",
            regfix_config.provision.output_dir.display()
        );
        println!(
            "  Quorum:        {}-of-{}",
            regfix_config.provision.threshold, regfix_config.provision.signers
        );
        println!(
            "  Addresses:     {} per scenario",
            regfix_config.provision.multisig_count
        );
        println!(
            "  Signer target: {} BTC",
            regfix_config.funding.signer_min_balance_btc
        );
        match regfix_config.provision.seed {
            Some(seed) => println!("  Seed:          {}", seed),
            None => println!("  Seed:          (entropy)"),
        }
        return Ok(());
    }

    if list_only {
        for (scenario, exists) in runner::list(&regfix_config.provision.output_dir) {
            println!(
                "{:<13} {}",
                scenario,
                if exists { "provisioned" } else { "pending" }
            );
        }
        return Ok(());
    }

    // Single-threaded runtime: every RPC is sequential. RPCs block the thread,
    // so Ctrl-C is only observed once the call in flight returns.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let outcome = rt.block_on(async {
        tokio::select! {
            result = runner::run(&regfix_config, &scenarios, force) => result,
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupted. Scenarios without a fixture will be redone on the next run.");
                Ok(())
            }
        }
    });

    if let Err(e) = outcome {
        log::error!("regfix failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"regfix: regtest multisig wallet fixture provisioner

USAGE:
    regfix [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Config file path (default: ./regfix.toml, optional)
    -s, --scenario <NAME>   Provision only this scenario (repeatable)
    -f, --force             Re-provision scenarios whose fixture exists
    --list                  Show fixture status per scenario and exit
    --validate              Validate configuration and exit
    -h, --help              Show this help message
    -V, --version           Show version

SCENARIOS:
    bad_privacy, bad_waste, good_privacy, good_waste

ENVIRONMENT VARIABLES (override config file):
    REGFIX_RPC_HOST       bitcoind RPC host
    REGFIX_RPC_PORT       bitcoind RPC port
    REGFIX_RPC_USER       RPC username
    REGFIX_RPC_PASSWORD   RPC password
    REGFIX_OUTPUT_DIR     Fixture output directory
    REGFIX_LOG_LEVEL      Log level (error/warn/info/debug/trace)
    REGFIX_SEED           RNG seed for reproducible patterns

INTERRUPTING:
    Ctrl-C stops the run after the RPC in flight returns. A slow call such
    as a large generatetoaddress finishes first. Nothing is rolled back;
    scenarios without a fixture are provisioned again on the next run.

EXAMPLES:
    # Provision every missing scenario against a local regtest node
    regfix

    # Rebuild one scenario from scratch
    regfix --scenario bad_privacy --force
"#
    );
}
