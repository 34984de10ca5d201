//! Scenario orchestration
//!
//! Runs the full pipeline for each scenario and writes its fixture. A
//! scenario whose fixture already exists is skipped without touching the
//! node, which makes repeated runs against the same node safe.

use crate::fixture::{fixture_path, ClientConfig, FixtureDocument};
use crate::funding::{fund_wallet, FundingOutcome, FundingPlan};
use crate::keys::{extract_keys, Signer};
use crate::multisig::{build_multisig_addresses, fund_multisig_addresses, MultisigFundingPolicy};
use crate::patterns::{self, Destinations, PatternConfig, PatternReport};
use crate::wallet::{ensure_wallet, WalletContext};
use crate::FixtureError;
use bitcoin::Amount;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regfix_rpc::{NodeRpc, NodeRpcExt};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// The fixed set of wallet-health scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scenario {
    BadPrivacy,
    BadWaste,
    GoodPrivacy,
    GoodWaste,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::BadPrivacy,
        Scenario::BadWaste,
        Scenario::GoodPrivacy,
        Scenario::GoodWaste,
    ];

    /// Prefix for wallet names and the fixture file name
    pub fn slug(&self) -> &'static str {
        match self {
            Self::BadPrivacy => "bad_privacy",
            Self::BadWaste => "bad_waste",
            Self::GoodPrivacy => "good_privacy",
            Self::GoodWaste => "good_waste",
        }
    }

    /// Wallet name shown by the coordinator UI
    pub fn title(&self) -> &'static str {
        match self {
            Self::BadPrivacy => "Bad Privacy Multisig",
            Self::BadWaste => "Bad Waste Multisig",
            Self::GoodPrivacy => "Good Privacy Multisig",
            Self::GoodWaste => "Good Waste Multisig",
        }
    }

    pub fn signer_wallet(&self, index: usize) -> String {
        format!("{}_signer_{}", self.slug(), index)
    }

    pub fn watcher_wallet(&self) -> String {
        format!("{}_watcher", self.slug())
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Scenario {
    type Err = FixtureError;

    /// Accepts `bad_privacy` as well as `bad-privacy`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.slug() == normalized)
            .ok_or_else(|| FixtureError::UnknownScenario(s.to_string()))
    }
}

/// Everything the provisioner needs besides the node handle
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Directory receiving `<scenario>.json`
    pub output_dir: PathBuf,
    /// Re-provision scenarios whose fixture already exists
    pub force: bool,
    /// Node URL written into fixtures
    pub node_url: String,
    pub rpc_username: String,
    pub rpc_password: String,
    pub threshold: usize,
    pub signers: usize,
    /// Threshold addresses built per scenario
    pub multisig_count: usize,
    /// Balance each signer wallet is funded toward
    pub signer_min_balance: Amount,
    /// RNG seed; entropy when unset
    pub seed: Option<u64>,
    pub funding: FundingPlan,
    pub multisig_funding: MultisigFundingPolicy,
    pub patterns: PatternConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("fixtures"),
            force: false,
            node_url: regfix_rpc::node_url("127.0.0.1", regfix_rpc::REGTEST_RPC_PORT),
            rpc_username: "user".to_string(),
            rpc_password: "pass".to_string(),
            threshold: 2,
            signers: 2,
            multisig_count: 4,
            signer_min_balance: Amount::from_int_btc(20),
            seed: None,
            funding: FundingPlan::default(),
            multisig_funding: MultisigFundingPolicy::default(),
            patterns: PatternConfig::default(),
        }
    }
}

/// A provisioned scenario
#[derive(Debug, Clone)]
pub struct ScenarioRun {
    pub scenario: Scenario,
    pub path: PathBuf,
    pub document: FixtureDocument,
    /// One entry per signer wallet
    pub funding: Vec<FundingOutcome>,
    pub multisig_addresses: Vec<String>,
    pub report: PatternReport,
}

/// What [`Provisioner::run_selected`] did for one scenario
#[derive(Debug, Clone)]
pub enum ScenarioStatus {
    /// Fixture was already there
    Skipped { scenario: Scenario, path: PathBuf },
    Provisioned(Box<ScenarioRun>),
}

impl ScenarioStatus {
    pub fn scenario(&self) -> Scenario {
        match self {
            Self::Skipped { scenario, .. } => *scenario,
            Self::Provisioned(run) => run.scenario,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Skipped { path, .. } => path,
            Self::Provisioned(run) => &run.path,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Drives scenarios against one node
pub struct Provisioner {
    rpc: Arc<dyn NodeRpc>,
    config: ProvisionConfig,
    rng: StdRng,
}

impl Provisioner {
    pub fn new(rpc: Arc<dyn NodeRpc>, config: ProvisionConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rpc, config, rng }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn fixture_path(&self, scenario: Scenario) -> PathBuf {
        fixture_path(&self.config.output_dir, scenario.slug())
    }

    /// Fail fast if the node does not answer.
    pub fn check_connectivity(&self) -> Result<(), FixtureError> {
        let info: Value = self
            .rpc
            .call_as(None, "getblockchaininfo", &[])
            .map_err(|source| FixtureError::Unreachable {
                url: self.config.node_url.clone(),
                source,
            })?;
        log::info!(
            "Connected to {} (chain={}, blocks={})",
            self.config.node_url,
            info.get("chain").and_then(Value::as_str).unwrap_or("?"),
            info.get("blocks").and_then(Value::as_u64).unwrap_or(0)
        );
        Ok(())
    }

    /// Provision every scenario.
    pub async fn run_all(&mut self) -> Result<Vec<ScenarioStatus>, FixtureError> {
        self.run_selected(&Scenario::ALL).await
    }

    /// Provision `scenarios` in order, skipping those already exported.
    pub async fn run_selected(
        &mut self,
        scenarios: &[Scenario],
    ) -> Result<Vec<ScenarioStatus>, FixtureError> {
        self.check_connectivity()?;

        let mut statuses = Vec::with_capacity(scenarios.len());
        for &scenario in scenarios {
            let path = self.fixture_path(scenario);
            if path.exists() && !self.config.force {
                log::info!(
                    "[{}] Fixture {} exists, skipping",
                    scenario,
                    path.display()
                );
                statuses.push(ScenarioStatus::Skipped { scenario, path });
                continue;
            }

            let run = self.run_scenario(scenario).await?;
            statuses.push(ScenarioStatus::Provisioned(Box::new(run)));
        }
        Ok(statuses)
    }

    /// Run the whole pipeline for one scenario and write its fixture.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> Result<ScenarioRun, FixtureError> {
        let total = self.config.signers;
        let threshold = self.config.threshold;
        if total == 0 || threshold == 0 || threshold > total {
            return Err(FixtureError::InvalidSigners(format!(
                "{}-of-{}",
                threshold, total
            )));
        }
        log::info!("[{}] Provisioning {}-of-{}", scenario, threshold, total);

        let mut wallets: Vec<WalletContext> = Vec::with_capacity(total);
        for index in 1..=total {
            wallets.push(ensure_wallet(&self.rpc, &scenario.signer_wallet(index), false)?);
        }

        let mut funding = Vec::with_capacity(total);
        for wallet in &wallets {
            funding.push(
                fund_wallet(wallet, self.config.signer_min_balance, &self.config.funding).await,
            );
        }

        let signers: Vec<Signer> = wallets
            .iter()
            .enumerate()
            .map(|(i, wallet)| {
                let index = i as u32 + 1;
                extract_keys(wallet, index, &format!("{} Signer {}", scenario.title(), index))
            })
            .collect();

        let watcher_name = scenario.watcher_wallet();
        let mut set = build_multisig_addresses(
            &self.rpc,
            &wallets,
            &signers,
            threshold,
            self.config.multisig_count,
            &watcher_name,
        )?;

        let coordinator = &wallets[0];
        fund_multisig_addresses(coordinator, &mut set.addresses, &self.config.multisig_funding);

        let cosigner = wallets.get(1).unwrap_or(coordinator).clone();
        let mut dest = Destinations::new(&set.watcher, cosigner);
        let report = self.run_pattern(scenario, coordinator, &mut dest).await?;

        let document = FixtureDocument::new(
            scenario.title(),
            threshold,
            &signers,
            ClientConfig::private(
                self.config.node_url.as_str(),
                self.config.rpc_username.as_str(),
                self.config.rpc_password.as_str(),
                watcher_name,
            ),
        );
        let path = self.fixture_path(scenario);
        document.save(&path, self.config.force)?;
        log::info!("[{}] Wrote {}", scenario, path.display());

        Ok(ScenarioRun {
            scenario,
            path,
            document,
            funding,
            multisig_addresses: set.addresses.into_iter().map(|a| a.address).collect(),
            report,
        })
    }

    async fn run_pattern(
        &mut self,
        scenario: Scenario,
        coordinator: &WalletContext,
        dest: &mut Destinations,
    ) -> Result<PatternReport, FixtureError> {
        let config = &self.config.patterns;
        let rng = &mut self.rng;
        match scenario {
            Scenario::BadPrivacy => {
                patterns::bad_privacy(coordinator, dest, &self.config.funding, config).await
            }
            Scenario::BadWaste => patterns::bad_waste(coordinator, dest, rng, config).await,
            Scenario::GoodPrivacy => patterns::good_privacy(coordinator, dest, rng, config).await,
            Scenario::GoodWaste => patterns::good_waste(coordinator, dest, rng, config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::RetryPolicy;
    use crate::keys::KeyFidelity;
    use crate::test_utils::MockNode;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> ProvisionConfig {
        ProvisionConfig {
            output_dir: dir.to_path_buf(),
            seed: Some(7),
            funding: FundingPlan {
                settle_delay: Duration::ZERO,
                retry: RetryPolicy::immediate(2),
                ..FundingPlan::default()
            },
            patterns: PatternConfig {
                pacing: Duration::ZERO,
                max_jitter: Duration::ZERO,
                ..PatternConfig::default()
            },
            ..ProvisionConfig::default()
        }
    }

    fn provisioner(node: &Arc<MockNode>, config: ProvisionConfig) -> Provisioner {
        let rpc: Arc<dyn NodeRpc> = node.clone();
        Provisioner::new(rpc, config)
    }

    #[test]
    fn test_scenario_names() {
        assert_eq!(Scenario::BadPrivacy.signer_wallet(1), "bad_privacy_signer_1");
        assert_eq!(Scenario::GoodWaste.watcher_wallet(), "good_waste_watcher");
        assert_eq!("bad-waste".parse::<Scenario>().unwrap(), Scenario::BadWaste);
        assert_eq!(" Good_Privacy ".parse::<Scenario>().unwrap(), Scenario::GoodPrivacy);
        assert!(matches!(
            "ugly_fees".parse::<Scenario>(),
            Err(FixtureError::UnknownScenario(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_privacy_end_to_end() {
        let dir = tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        let mut p = provisioner(&node, test_config(dir.path()));

        let run = p.run_scenario(Scenario::BadPrivacy).await.unwrap();

        let report = &run.report;
        assert!(!report.degraded);
        let half = Amount::from_sat(50_000_000);
        let reused: BTreeSet<&str> = report
            .payments
            .iter()
            .filter(|p| p.amount == half)
            .map(|p| p.address.as_str())
            .collect();
        assert_eq!(report.payments.iter().filter(|p| p.amount == half).count(), 8);
        assert_eq!(reused.len(), 1);

        let round: Vec<&crate::Payment> = report.payments[8..].iter().collect();
        assert_eq!(round.len(), 3);
        let round_addrs: BTreeSet<&str> = round.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(round_addrs.len(), 3);
        assert!(round_addrs.is_disjoint(&reused));
        assert_eq!(report.confirmed().count(), 11);

        // exactly one confirmation step once the pattern starts
        let calls = node.calls();
        let start = calls
            .iter()
            .position(|c| c.method == "deriveaddresses")
            .unwrap();
        let confirmations = calls[start..]
            .iter()
            .filter(|c| c.method == "generatetoaddress")
            .count();
        assert_eq!(confirmations, 1);

        let doc = FixtureDocument::load(&run.path).unwrap();
        assert_eq!(doc.extended_public_keys.len(), 2);
        assert_eq!(doc.quorum.required_signers, 2);
        assert_eq!(doc.quorum.total_signers, 2);
        assert_eq!(doc.key_fidelity, KeyFidelity::Node);
        assert_eq!(doc.client.wallet_name, "bad_privacy_watcher");
        assert_eq!(run.multisig_addresses.len(), 4);
        assert!(run.funding.iter().all(|f| f.is_funded()));
    }

    #[tokio::test]
    async fn test_run_all_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        let mut p = provisioner(&node, test_config(dir.path()));

        let first = p.run_all().await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|s| !s.is_skipped()));
        for scenario in Scenario::ALL {
            assert!(p.fixture_path(scenario).exists());
        }

        node.clear_calls();
        let second = p.run_all().await.unwrap();
        assert!(second.iter().all(ScenarioStatus::is_skipped));
        assert!(node.mutating_calls().is_empty());
        assert_eq!(node.count_calls("getblockchaininfo"), 1);
        assert_eq!(node.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_force_reprovisions() {
        let dir = tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        let mut p = provisioner(&node, test_config(dir.path()));
        p.run_selected(&[Scenario::GoodWaste]).await.unwrap();

        let mut config = test_config(dir.path());
        config.force = true;
        let mut forced = provisioner(&node, config);
        node.clear_calls();
        let statuses = forced.run_selected(&[Scenario::GoodWaste]).await.unwrap();

        assert!(!statuses[0].is_skipped());
        assert!(!node.mutating_calls().is_empty());
        // wallets are reused, not recreated
        assert_eq!(node.count_calls("createwallet"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_fatal() {
        let dir = tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        node.fail_method("getblockchaininfo", -28, "Loading block index...");
        let mut p = provisioner(&node, test_config(dir.path()));

        let err = p.run_all().await.unwrap_err();
        assert!(matches!(err, FixtureError::Unreachable { .. }));
        assert_eq!(node.calls().len(), 1);
        assert!(!p.fixture_path(Scenario::BadPrivacy).exists());
    }

    #[tokio::test]
    async fn test_degraded_node_still_exports() {
        let dir = tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        node.fail_method("generatetoaddress", -1, "mining disabled");
        let mut p = provisioner(&node, test_config(dir.path()));

        let run = p.run_scenario(Scenario::GoodPrivacy).await.unwrap();
        assert!(run.funding.iter().all(|f| *f == FundingOutcome::Unfunded));
        assert!(run.report.degraded);
        assert_eq!(run.report.payments.len(), 3);
        assert!(run.path.exists());
    }

    #[tokio::test]
    async fn test_rejects_impossible_quorum() {
        let dir = tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        let config = ProvisionConfig {
            threshold: 3,
            ..test_config(dir.path())
        };
        let mut p = provisioner(&node, config);

        let err = p.run_scenario(Scenario::BadWaste).await.unwrap_err();
        assert!(matches!(err, FixtureError::InvalidSigners(_)));
        assert!(node.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fixture_uses_signer_keys() {
        let dir = tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        let mut p = provisioner(&node, test_config(dir.path()));

        let run = p.run_scenario(Scenario::BadWaste).await.unwrap();
        let xpubs: Vec<&str> = run
            .document
            .extended_public_keys
            .iter()
            .map(|k| k.xpub.as_str())
            .collect();
        assert_eq!(
            xpubs,
            vec![crate::test_utils::TEST_XPUB_1, crate::test_utils::TEST_XPUB_2]
        );
        assert_eq!(run.document.name, "Bad Waste Multisig");
    }
}
