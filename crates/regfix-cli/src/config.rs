//! regfix configuration, parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use bitcoin::Amount;
use regfix_core::funding::{FundingPlan, RetryPolicy};
use regfix_core::multisig::MultisigFundingPolicy;
use regfix_core::{PatternConfig, ProvisionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegfixConfig {
    /// Node RPC connection
    #[serde(default)]
    pub node: NodeSection,

    /// What to build and where to write it
    #[serde(default)]
    pub provision: ProvisionSection,

    /// Signer wallet funding
    #[serde(default)]
    pub funding: FundingSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// bitcoind RPC endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_password")]
    pub password: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
        }
    }
}

/// Scenario provisioning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionSection {
    /// Directory receiving one JSON fixture per scenario
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Signatures required (M of M-of-N)
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Signer wallets per scenario (N)
    #[serde(default = "default_signers")]
    pub signers: usize,

    /// Threshold addresses built per scenario
    #[serde(default = "default_multisig_count")]
    pub multisig_count: usize,

    /// RNG seed for reproducible amounts and timing
    #[serde(default)]
    pub seed: Option<u64>,

    /// Pause after each pattern transaction
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Upper bound of the random pause between good-privacy payments
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Blocks mined to confirm each pattern
    #[serde(default = "default_confirm_blocks")]
    pub confirm_blocks: u64,
}

impl Default for ProvisionSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            threshold: default_threshold(),
            signers: default_signers(),
            multisig_count: default_multisig_count(),
            seed: None,
            pacing_ms: default_pacing_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            confirm_blocks: default_confirm_blocks(),
        }
    }
}

/// Funding convergence settings (amounts in BTC)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSection {
    /// Balance each signer wallet is funded toward
    #[serde(default = "default_signer_min_balance")]
    pub signer_min_balance_btc: f64,

    /// Long-lived wallet holding matured coinbase outputs
    #[serde(default = "default_source_wallet")]
    pub source_wallet: String,

    /// Source keeps at least this much before paying out
    #[serde(default = "default_source_margin")]
    pub source_margin_btc: f64,

    /// Sent from the source when mining alone is not enough
    #[serde(default = "default_transfer")]
    pub transfer_btc: f64,

    /// Blocks mined to a fresh signer wallet
    #[serde(default = "default_bootstrap_blocks")]
    pub bootstrap_blocks: u64,

    /// Blocks mined to the source wallet when it runs dry
    #[serde(default = "default_maturity_blocks")]
    pub maturity_blocks: u64,

    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for FundingSection {
    fn default() -> Self {
        Self {
            signer_min_balance_btc: default_signer_min_balance(),
            source_wallet: default_source_wallet(),
            source_margin_btc: default_source_margin(),
            transfer_btc: default_transfer(),
            bootstrap_blocks: default_bootstrap_blocks(),
            maturity_blocks: default_maturity_blocks(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    regfix_rpc::REGTEST_RPC_PORT
}

fn default_user() -> String {
    "user".to_string()
}

fn default_password() -> String {
    "pass".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("fixtures")
}

fn default_threshold() -> usize {
    2
}

fn default_signers() -> usize {
    2
}

fn default_multisig_count() -> usize {
    4
}

fn default_pacing_ms() -> u64 {
    200
}

fn default_max_jitter_ms() -> u64 {
    3000
}

fn default_confirm_blocks() -> u64 {
    6
}

fn default_signer_min_balance() -> f64 {
    20.0
}

fn default_source_wallet() -> String {
    "miner".to_string()
}

fn default_source_margin() -> f64 {
    25.0
}

fn default_transfer() -> f64 {
    20.0
}

fn default_bootstrap_blocks() -> u64 {
    50
}

fn default_maturity_blocks() -> u64 {
    101 // coinbase maturity + 1
}

fn default_poll_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl RegfixConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: RegfixConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `REGFIX_RPC_HOST`
    /// - `REGFIX_RPC_PORT`
    /// - `REGFIX_RPC_USER`
    /// - `REGFIX_RPC_PASSWORD`
    /// - `REGFIX_OUTPUT_DIR`
    /// - `REGFIX_LOG_LEVEL`
    /// - `REGFIX_SEED`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REGFIX_RPC_HOST") {
            self.node.host = v;
        }
        if let Ok(v) = std::env::var("REGFIX_RPC_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.node.port = port;
            }
        }
        if let Ok(v) = std::env::var("REGFIX_RPC_USER") {
            self.node.user = v;
        }
        if let Ok(v) = std::env::var("REGFIX_RPC_PASSWORD") {
            self.node.password = v;
        }
        if let Ok(v) = std::env::var("REGFIX_OUTPUT_DIR") {
            self.provision.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REGFIX_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("REGFIX_SEED") {
            if let Ok(seed) = v.parse::<u64>() {
                self.provision.seed = Some(seed);
            }
        }
    }

    pub fn node_url(&self) -> String {
        regfix_rpc::node_url(&self.node.host, self.node.port)
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.node.port > 0, "node.port must be > 0");
        anyhow::ensure!(!self.node.host.is_empty(), "node.host must not be empty");
        anyhow::ensure!(!self.node.user.is_empty(), "node.user must not be empty");
        anyhow::ensure!(
            !self.node.password.is_empty(),
            "node.password must not be empty"
        );

        anyhow::ensure!(self.provision.signers > 0, "provision.signers must be > 0");
        anyhow::ensure!(
            self.provision.threshold > 0 && self.provision.threshold <= self.provision.signers,
            "provision.threshold must be between 1 and provision.signers ({})",
            self.provision.signers
        );
        anyhow::ensure!(
            self.provision.multisig_count > 0,
            "provision.multisig_count must be > 0"
        );

        anyhow::ensure!(
            self.funding.poll_attempts > 0,
            "funding.poll_attempts must be > 0"
        );
        anyhow::ensure!(
            !self.funding.source_wallet.is_empty(),
            "funding.source_wallet must not be empty"
        );

        // Surfaces negative or non-finite amounts here rather than mid-run
        self.funding_plan()?;
        btc("funding.signer_min_balance_btc", self.funding.signer_min_balance_btc)?;

        Ok(())
    }

    fn funding_plan(&self) -> Result<FundingPlan> {
        Ok(FundingPlan {
            bootstrap_blocks: self.funding.bootstrap_blocks,
            maturity_blocks: self.funding.maturity_blocks,
            source_wallet: self.funding.source_wallet.clone(),
            source_safety_margin: btc("funding.source_margin_btc", self.funding.source_margin_btc)?,
            transfer_amount: btc("funding.transfer_btc", self.funding.transfer_btc)?,
            retry: RetryPolicy::new(
                self.funding.poll_attempts,
                Duration::from_millis(self.funding.poll_interval_ms),
            ),
            ..FundingPlan::default()
        })
    }

    /// Build the provisioner settings. `force` comes from the command line.
    pub fn provision_config(&self, force: bool) -> Result<ProvisionConfig> {
        Ok(ProvisionConfig {
            output_dir: self.provision.output_dir.clone(),
            force,
            node_url: self.node_url(),
            rpc_username: self.node.user.clone(),
            rpc_password: self.node.password.clone(),
            threshold: self.provision.threshold,
            signers: self.provision.signers,
            multisig_count: self.provision.multisig_count,
            signer_min_balance: btc(
                "funding.signer_min_balance_btc",
                self.funding.signer_min_balance_btc,
            )?,
            seed: self.provision.seed,
            funding: self.funding_plan()?,
            multisig_funding: MultisigFundingPolicy {
                confirm_blocks: self.provision.confirm_blocks,
                ..MultisigFundingPolicy::default()
            },
            patterns: PatternConfig {
                confirm_blocks: self.provision.confirm_blocks,
                pacing: Duration::from_millis(self.provision.pacing_ms),
                max_jitter: Duration::from_millis(self.provision.max_jitter_ms),
                ..PatternConfig::default()
            },
        })
    }
}

fn btc(field: &str, value: f64) -> Result<Amount> {
    Amount::from_btc(value).with_context(|| format!("{} is not a valid amount: {}", field, value))
}

// ============================================================================
// Tests
// ============================================================================
